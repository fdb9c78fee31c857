//! Swarm coordination for a single torrent.
//!
//! A [`Swarm`] ties the pieces together: it keeps the registry of
//! connections, runs one task per connection and one coordinator task for
//! the periodic cycles, and publishes progress as [`SwarmEvent`]s.
//!
//! # Tasks
//!
//! ```text
//!            candidate_peer / accept
//!                     |
//!                     v
//!   +-----------------------------------+
//!   | Shared                            |      choke / refill / announce
//!   |   Mutex<SwarmState>               | <--- coordinator task
//!   |     PieceTracker + PeerRegistry   |
//!   +-----------------------------------+
//!          ^          ^          ^
//!          |          |          |        PeerCommand (mpsc)
//!       session    session    session  <---------------------
//!          |          |          |
//!        socket     socket     socket
//! ```
//!
//! Every piece of torrent-wide bookkeeping lives in one mutex, taken in
//! short synchronous sections and never held across an await point.
//! Stopping flips a `watch` flag that every task selects on.
//!
//! # Examples
//!
//! ```no_run
//! use btswarm::config::SwarmConfig;
//! use btswarm::peer::PeerId;
//! use btswarm::storage::MemoryStorage;
//! use btswarm::swarm::Swarm;
//! use btswarm::torrent::Torrent;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let content = vec![7u8; 100_000];
//! let torrent = Arc::new(Torrent::from_content("data.bin", &content, 32768)?);
//! let storage = Arc::new(MemoryStorage::new(content.len() as u64));
//!
//! let swarm = Swarm::new(torrent, storage, SwarmConfig::default(), PeerId::generate(), None)?;
//! swarm.start().await?;
//! swarm.candidate_peer("127.0.0.1:6881".parse()?);
//! swarm.wait_for_seeding().await?;
//! swarm.stop().await;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod error;
mod events;
mod registry;
mod session;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use crate::config::SwarmConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::discovery::{Announce, AnnounceEvent, CandidateSink, Discovery};
use crate::peer::{
    ChokingPolicy, ExtensionHandler, Handshake, IgnoreExtensions, PeerId, PeerKey, PeerTransport,
};
use crate::piece::{PieceSelector, PieceTracker};
use crate::storage::{PieceStorage, PieceStore};
use crate::torrent::{InfoHash, Torrent};

pub use error::SwarmError;
pub use events::{LocalState, Role, SwarmEvent};

use registry::{Admission, PeerCommand, PeerRegistry};

/// Resolves once the shutdown flag is set. The watch guard is released
/// inside, so the future stays `Send` when raced against other branches.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Torrent-wide bookkeeping guarded by one lock.
pub(crate) struct SwarmState {
    pub tracker: PieceTracker,
    pub registry: PeerRegistry,
    pub uploaded: u64,
    pub downloaded: u64,
}

pub(crate) struct Shared {
    this: Weak<Shared>,
    pub torrent: Arc<Torrent>,
    pub store: Arc<PieceStore>,
    pub config: SwarmConfig,
    pub peer_id: PeerId,
    pub listen_addr: Option<SocketAddr>,
    pub selector: PieceSelector,
    pub state: Mutex<SwarmState>,
    pub role: watch::Sender<Role>,
    pub shutdown: watch::Sender<bool>,
    events: broadcast::Sender<SwarmEvent>,
    extensions: RwLock<Arc<dyn ExtensionHandler>>,
    discovery: RwLock<Vec<Arc<dyn Discovery>>>,
    sessions: Mutex<Option<JoinSet<()>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Shared {
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn emit(&self, event: SwarmEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn extension_handler(&self) -> Arc<dyn ExtensionHandler> {
        self.extensions.read().clone()
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.sessions.lock().as_mut() {
            Some(sessions) => {
                sessions.spawn(task);
                true
            }
            None => false,
        }
    }

    pub fn reap_sessions(&self) {
        if let Some(sessions) = self.sessions.lock().as_mut() {
            while sessions.try_join_next().is_some() {}
        }
    }

    pub fn spawn_outbound(self: &Arc<Self>, key: PeerKey, addr: SocketAddr, commands: mpsc::UnboundedReceiver<PeerCommand>) {
        tracing::debug!(peer = %addr, %key, "dialing peer");
        if !self.spawn(session::run_outbound(self.clone(), key, addr, commands)) {
            self.state.lock().registry.remove(key);
        }
    }

    /// Drops a connection's registry entry and dials a queued candidate
    /// into the freed slot.
    pub fn forget(self: &Arc<Self>, key: PeerKey) {
        let next = {
            let mut state = self.state.lock();
            state.registry.remove(key);
            if self.is_stopping() {
                None
            } else {
                state.registry.next_pending(Instant::now())
            }
        };
        if let Some((key, addr, commands)) = next {
            self.spawn_outbound(key, addr, commands);
        }
    }

    /// Resets a piece after its data could not be stored or read back.
    pub fn storage_failure(&self, piece: u32, error: String) {
        tracing::warn!(piece, %error, "storage failure");
        {
            let mut state = self.state.lock();
            for (req, owner) in state.tracker.abort_piece(piece) {
                state.registry.send(owner, PeerCommand::Cancel(req));
            }
        }
        self.emit(SwarmEvent::StorageFailure { piece, error });
    }

    fn announcement(&self, event: AnnounceEvent) -> Announce {
        let state = self.state.lock();
        Announce {
            info_hash: self.torrent.info_hash(),
            role: *self.role.borrow(),
            event,
            uploaded: state.uploaded,
            downloaded: state.downloaded,
            left: state.tracker.left_bytes(),
            listen_addr: self.listen_addr,
        }
    }

    /// Announces to every discovery collaborator in turn.
    pub async fn announce(&self, event: AnnounceEvent) {
        let collaborators = self.discovery.read().clone();
        if collaborators.is_empty() {
            return;
        }
        let announce = self.announcement(event);
        for discovery in collaborators {
            if timeout(self.config.handshake_timeout, discovery.announce(&announce))
                .await
                .is_err()
            {
                tracing::debug!(event = event.as_str(), "announce timed out");
            }
        }
    }

    fn candidate(self: &Arc<Self>, addr: SocketAddr) {
        if self.is_stopping() || !self.started.load(Ordering::Acquire) || Some(addr) == self.listen_addr {
            return;
        }

        let (admission, connections, pending) = {
            let mut state = self.state.lock();
            let admission = state.registry.candidate(addr, Instant::now());
            (admission, state.registry.len(), state.registry.pending_count())
        };
        match admission {
            Admission::Dial(key, commands) => self.spawn_outbound(key, addr, commands),
            Admission::Queued => tracing::trace!(peer = %addr, connections, pending, "candidate queued"),
            Admission::Ignored => tracing::trace!(peer = %addr, "candidate ignored"),
        }
    }
}

impl CandidateSink for Shared {
    fn candidate_peer(&self, info_hash: InfoHash, addr: SocketAddr) {
        if info_hash != self.torrent.info_hash() {
            return;
        }
        if let Some(shared) = self.this.upgrade() {
            shared.candidate(addr);
        }
    }
}

/// Handle to one torrent's swarm. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Swarm {
    shared: Arc<Shared>,
}

impl Swarm {
    pub fn new(
        torrent: Arc<Torrent>,
        storage: Arc<dyn PieceStorage>,
        config: SwarmConfig,
        peer_id: PeerId,
        listen_addr: Option<SocketAddr>,
    ) -> Result<Self, SwarmError> {
        config.validate()?;

        let store = Arc::new(PieceStore::new(torrent.clone(), storage));
        let tracker = PieceTracker::new(torrent.clone(), config.block_size, config.endgame_threshold);
        let registry = PeerRegistry::new(peer_id, config.max_connections, config.reconnect_backoff);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            torrent,
            store,
            config,
            peer_id,
            listen_addr,
            selector: PieceSelector::default(),
            state: Mutex::new(SwarmState {
                tracker,
                registry,
                uploaded: 0,
                downloaded: 0,
            }),
            role: watch::Sender::new(Role::Leeching),
            shutdown: watch::Sender::new(false),
            events,
            extensions: RwLock::new(Arc::new(IgnoreExtensions)),
            discovery: RwLock::new(Vec::new()),
            sessions: Mutex::new(Some(JoinSet::new())),
            coordinator: Mutex::new(None),
            started: AtomicBool::new(false),
        });

        Ok(Self { shared })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.shared.torrent.info_hash()
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.shared.torrent
    }

    /// Verified access to the content.
    pub fn store(&self) -> &Arc<PieceStore> {
        &self.shared.store
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.shared.config
    }

    /// Replaces the receiver of extension protocol messages.
    pub fn set_extension_handler(&self, handler: Arc<dyn ExtensionHandler>) {
        *self.shared.extensions.write() = handler;
    }

    /// Loads existing data (if `verify_on_start`) and starts the
    /// coordinator.
    pub async fn start(&self) -> Result<(), SwarmError> {
        if self.shared.is_stopping() {
            return Err(SwarmError::Stopped);
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(SwarmError::AlreadyStarted);
        }

        let valid = if self.shared.config.verify_on_start {
            Some(self.shared.store.recheck().await)
        } else {
            None
        };

        let (pieces, seeding) = {
            let mut state = self.shared.state.lock();
            if let Some(valid) = &valid {
                state.tracker.load_verified(valid);
            }
            (state.tracker.bitfield().count(), state.tracker.is_seeding())
        };
        if seeding {
            self.shared.role.send_replace(Role::Seeding);
        }

        tracing::info!(
            info_hash = %self.info_hash(),
            name = self.shared.torrent.name(),
            pieces,
            total = self.shared.torrent.piece_count(),
            seeding,
            "swarm started"
        );

        let policy = ChokingPolicy::new(
            self.shared.config.unchoke_slots,
            self.shared.config.optimistic_unchoke_interval,
        );
        let handle = tokio::spawn(coordinator::run(self.shared.clone(), policy));
        *self.shared.coordinator.lock() = Some(handle);
        Ok(())
    }

    /// Stops every task and waits for them to finish. Calling it again does
    /// nothing.
    pub async fn stop(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }

        self.shared.state.lock().registry.close_all();
        let sessions = self.shared.sessions.lock().take();
        if let Some(mut sessions) = sessions {
            while sessions.join_next().await.is_some() {}
        }

        let coordinator = self.shared.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            if let Err(e) = coordinator.await {
                tracing::warn!(error = %e, "coordinator task failed");
            }
        }

        if let Err(e) = self.shared.store.flush().await {
            tracing::warn!(error = %e, "failed to flush storage");
        }

        tracing::info!(info_hash = %self.info_hash(), "swarm stopped");
        self.shared.emit(SwarmEvent::Stopped);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Registers a discovery collaborator. A running swarm announces to it
    /// right away.
    pub fn add_discovery(&self, discovery: Arc<dyn Discovery>) {
        self.shared.discovery.write().push(discovery.clone());

        if self.shared.started.load(Ordering::Acquire) && !self.shared.is_stopping() {
            let announce = self.shared.announcement(AnnounceEvent::Started);
            tokio::spawn(async move { discovery.announce(&announce).await });
        }
    }

    /// A sink that feeds discovery results into this swarm.
    pub fn candidate_sink(&self) -> Arc<dyn CandidateSink> {
        self.shared.clone()
    }

    /// Offers a peer address to connect to.
    ///
    /// Addresses already connected, queued, or attempted within
    /// `reconnect_backoff` are ignored. Without a free connection slot the
    /// address is queued.
    pub fn candidate_peer(&self, addr: SocketAddr) {
        self.shared.candidate(addr);
    }

    /// Takes over a connection whose handshake has already been read.
    ///
    /// The connection is dropped if the swarm is not running, the address is
    /// already connected, or the connection limit is reached.
    pub fn accept<S>(&self, addr: SocketAddr, transport: PeerTransport<S>, handshake: Handshake)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.shared.is_stopping() || !self.shared.started.load(Ordering::Acquire) {
            tracing::debug!(peer = %addr, "inbound connection refused, swarm not running");
            return;
        }

        let admitted = self.shared.state.lock().registry.admit_inbound(addr);
        let (key, commands) = match admitted {
            Ok(admitted) => admitted,
            Err(rejection) => {
                tracing::debug!(peer = %addr, %rejection, "inbound connection refused");
                return;
            }
        };

        let task = session::run_inbound(self.shared.clone(), key, addr, transport, handshake, commands);
        if !self.shared.spawn(task) {
            self.shared.state.lock().registry.remove(key);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.shared.events.subscribe()
    }

    pub fn role(&self) -> watch::Receiver<Role> {
        self.shared.role.subscribe()
    }

    /// Resolves once every piece is verified.
    pub async fn wait_for_seeding(&self) -> Result<(), SwarmError> {
        let mut role = self.shared.role.subscribe();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::select! {
            biased;
            seeding = async { role.wait_for(|role| *role == Role::Seeding).await.map(|_| ()) } => {
                seeding.map_err(|_| SwarmError::Stopped)
            }
            _ = stopped(&mut shutdown) => Err(SwarmError::Stopped),
        }
    }

    pub fn local_state(&self) -> LocalState {
        let role = *self.shared.role.borrow();
        let state = self.shared.state.lock();
        LocalState {
            role,
            peers: state.registry.active_count(),
            uploaded: state.uploaded,
            downloaded: state.downloaded,
            left: state.tracker.left_bytes(),
            completion: state.tracker.completion_ratio(),
        }
    }
}

#[cfg(test)]
mod tests;
