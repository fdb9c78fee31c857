//! btswarm - A BitTorrent swarm engine
//!
//! This library exchanges the pieces of torrents with a swarm of peers over
//! the BitTorrent peer wire protocol, verifying every piece against its
//! SHA-1 hash before it is stored or served.
//!
//! # Modules
//!
//! - [`torrent`] - Torrent description: info-hash, pieces, file layout
//! - [`storage`] - Verified piece storage over memory or files
//! - [`piece`] - Piece state tracking and rarest-first selection
//! - [`peer`] - BEP-3 peer wire protocol, connection state, choking
//! - [`swarm`] - Per-torrent coordination of connections and cycles
//! - [`engine`] - Listener and multi-torrent host
//! - [`discovery`] - Interface to peer sources, plus an in-process directory
//! - [`config`] - Engine and swarm settings
//! - [`constants`] - Protocol constants and tuning defaults
//!
//! # Example
//!
//! ```no_run
//! use btswarm::{Engine, EngineConfig, LocalDirectory, MemoryStorage, Torrent};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let directory = LocalDirectory::new();
//! let content = vec![1u8; 1 << 20];
//! let torrent = Arc::new(Torrent::from_content("file.bin", &content, 262144)?);
//!
//! let seeder = Engine::bind(EngineConfig::default().with_listen_addr("127.0.0.1:6881".parse()?)).await?;
//! let swarm = seeder
//!     .add_torrent(torrent.clone(), Arc::new(MemoryStorage::with_content(content)))
//!     .await?;
//! swarm.add_discovery(directory.client(seeder.candidate_sink()));
//!
//! let leecher = Engine::bind(EngineConfig::default().with_listen_addr("127.0.0.1:6882".parse()?)).await?;
//! let swarm = leecher
//!     .add_torrent(torrent.clone(), Arc::new(MemoryStorage::new(torrent.total_length())))
//!     .await?;
//! swarm.add_discovery(directory.client(leecher.candidate_sink()));
//! swarm.wait_for_seeding().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod discovery;
pub mod engine;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod swarm;
pub mod torrent;

pub use config::{ConfigError, EncryptionPolicy, EngineConfig, SwarmConfig};
pub use discovery::{Announce, AnnounceEvent, CandidateSink, Discovery, LocalDirectory};
pub use engine::Engine;
pub use peer::{
    Bitfield, BlockRequest, ChokingPolicy, ExtensionHandler, Handshake, Message, PeerConnection,
    PeerError, PeerId, PeerTransport,
};
pub use piece::{PieceSelector, PieceState, PieceTracker};
pub use storage::{FileStorage, MemoryStorage, PieceStorage, PieceStore, StorageError, Verification};
pub use swarm::{LocalState, Role, Swarm, SwarmError, SwarmEvent};
pub use torrent::{InfoHash, Torrent, TorrentError};
