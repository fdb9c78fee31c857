//! Multi-torrent host.
//!
//! An [`Engine`] owns the TCP listener and the local peer-id, and runs one
//! [`Swarm`] per torrent. Inbound connections are routed to the swarm
//! named by the info-hash in their handshake; discovery results reach the
//! right swarm through the engine's [`CandidateSink`].
//!
//! # Examples
//!
//! ```no_run
//! use btswarm::config::EngineConfig;
//! use btswarm::discovery::LocalDirectory;
//! use btswarm::engine::Engine;
//! use btswarm::storage::MemoryStorage;
//! use btswarm::torrent::Torrent;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::bind(EngineConfig::default()).await?;
//! let directory = LocalDirectory::new();
//!
//! let content = b"hello swarm".repeat(10_000);
//! let torrent = Arc::new(Torrent::from_content("hello.txt", &content, 65536)?);
//! let swarm = engine
//!     .add_torrent(torrent, Arc::new(MemoryStorage::with_content(content)))
//!     .await?;
//! swarm.add_discovery(directory.client(engine.candidate_sink()));
//!
//! tokio::signal::ctrl_c().await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::{EngineConfig, SwarmConfig};
use crate::discovery::CandidateSink;
use crate::peer::{PeerError, PeerId, PeerTransport};
use crate::storage::PieceStorage;
use crate::swarm::{stopped, Swarm, SwarmError};
use crate::torrent::{InfoHash, Torrent};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

struct EngineInner {
    config: EngineConfig,
    peer_id: PeerId,
    local_addr: SocketAddr,
    swarms: DashMap<InfoHash, Swarm>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn swarm(&self, info_hash: &InfoHash) -> Option<Swarm> {
        self.swarms.get(info_hash).map(|entry| entry.value().clone())
    }

    /// Reads the handshake of an accepted connection and hands it to the
    /// swarm it names.
    async fn route(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(peer = %addr, error = %e, "set_nodelay failed");
        }
        let mut transport = PeerTransport::new(stream);

        let handshake = match timeout(
            self.config.swarm.handshake_timeout,
            transport.receive_handshake(),
        )
        .await
        .unwrap_or(Err(PeerError::Timeout))
        {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "inbound handshake failed");
                return;
            }
        };

        match self.swarm(&handshake.info_hash) {
            Some(swarm) => swarm.accept(addr, transport, handshake),
            None => {
                tracing::debug!(peer = %addr, info_hash = %handshake.info_hash, "inbound connection for unknown torrent");
            }
        }
    }
}

impl CandidateSink for EngineInner {
    fn candidate_peer(&self, info_hash: InfoHash, addr: SocketAddr) {
        match self.swarm(&info_hash) {
            Some(swarm) => swarm.candidate_peer(addr),
            None => tracing::trace!(%info_hash, peer = %addr, "candidate for unknown torrent"),
        }
    }
}

async fn accept_loop(engine: Weak<EngineInner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        let (stream, addr) = tokio::select! {
            biased;

            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            },
        };

        let Some(engine) = engine.upgrade() else {
            break;
        };
        tracing::trace!(peer = %addr, "accepted connection");
        tokio::spawn(async move { engine.route(stream, addr).await });
    }
}

/// Hosts many swarms behind one listener and one peer-id.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(config: EngineConfig) -> Result<Self, SwarmError> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let peer_id = PeerId::generate();
        let (shutdown, shutdown_rx) = watch::channel(false);

        tracing::info!(%local_addr, %peer_id, encryption = ?config.encryption_policy, "engine listening");

        let inner = Arc::new(EngineInner {
            config,
            peer_id,
            local_addr,
            swarms: DashMap::new(),
            shutdown,
            listener: Mutex::new(None),
        });

        let handle = tokio::spawn(accept_loop(Arc::downgrade(&inner), listener, shutdown_rx));
        *inner.listener.lock() = Some(handle);

        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Adds and starts a swarm using the engine's default swarm settings.
    pub async fn add_torrent(&self, torrent: Arc<Torrent>, storage: Arc<dyn PieceStorage>) -> Result<Swarm, SwarmError> {
        self.add_torrent_with(torrent, storage, self.inner.config.swarm.clone())
            .await
    }

    /// Adds and starts a swarm with its own settings.
    pub async fn add_torrent_with(
        &self,
        torrent: Arc<Torrent>,
        storage: Arc<dyn PieceStorage>,
        config: SwarmConfig,
    ) -> Result<Swarm, SwarmError> {
        if self.inner.is_shut_down() {
            return Err(SwarmError::Stopped);
        }

        let info_hash = torrent.info_hash();
        let swarm = Swarm::new(torrent, storage, config, self.inner.peer_id, Some(self.inner.local_addr))?;
        match self.inner.swarms.entry(info_hash) {
            Entry::Occupied(_) => return Err(SwarmError::DuplicateTorrent(info_hash)),
            Entry::Vacant(slot) => {
                slot.insert(swarm.clone());
            }
        }

        if let Err(e) = swarm.start().await {
            self.inner.swarms.remove(&info_hash);
            return Err(e);
        }
        Ok(swarm)
    }

    pub fn swarm(&self, info_hash: &InfoHash) -> Option<Swarm> {
        self.inner.swarm(info_hash)
    }

    pub fn torrents(&self) -> Vec<InfoHash> {
        self.inner.swarms.iter().map(|entry| *entry.key()).collect()
    }

    /// Stops a swarm and forgets it.
    pub async fn remove_torrent(&self, info_hash: &InfoHash) -> Result<(), SwarmError> {
        let (_, swarm) = self
            .inner
            .swarms
            .remove(info_hash)
            .ok_or(SwarmError::UnknownTorrent(*info_hash))?;
        swarm.stop().await;
        Ok(())
    }

    /// A sink that routes discovery results to the matching swarm.
    pub fn candidate_sink(&self) -> Arc<dyn CandidateSink> {
        self.inner.clone()
    }

    /// Stops the listener and every swarm. Calling it again does nothing.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }

        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                tracing::warn!(error = %e, "listener task failed");
            }
        }

        let swarms: Vec<Swarm> = self
            .inner
            .swarms
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.swarms.clear();
        futures::future::join_all(swarms.iter().map(|swarm| swarm.stop())).await;

        tracing::info!(local_addr = %self.inner.local_addr, "engine shut down");
    }
}

impl CandidateSink for Engine {
    fn candidate_peer(&self, info_hash: InfoHash, addr: SocketAddr) {
        self.inner.candidate_peer(info_hash, addr);
    }
}

#[cfg(test)]
mod tests;
