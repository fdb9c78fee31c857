//! Peer discovery collaborators.
//!
//! The swarm does not speak any tracker or DHT protocol itself. It tells
//! every registered [`Discovery`] collaborator about its state through
//! [`Announce`]s, and collaborators hand candidate addresses back through a
//! [`CandidateSink`] (the [`Engine`] or a single [`Swarm`]).
//!
//! [`LocalDirectory`] is an in-process rendezvous point, useful for tests and
//! for embedders that run several engines in one process.
//!
//! [`Engine`]: crate::engine::Engine
//! [`Swarm`]: crate::swarm::Swarm

mod local;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::swarm::Role;
use crate::torrent::InfoHash;

pub use local::{LocalDirectory, LocalDirectoryClient};

/// Why an announce is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// The swarm started.
    Started,
    /// The last piece was verified.
    Completed,
    /// The swarm is stopping.
    Stopped,
    /// Regular re-announce.
    Periodic,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Periodic => "periodic",
        }
    }
}

/// State of a swarm reported to discovery collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub info_hash: InfoHash,
    pub role: Role,
    pub event: AnnounceEvent,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    /// Where other peers can reach us, if we accept connections.
    pub listen_addr: Option<SocketAddr>,
}

/// A source of peers for one or more torrents.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Publishes the local state. Failures are the collaborator's business.
    async fn announce(&self, announce: &Announce);
}

/// Receives candidate peer addresses. Delivery is fire-and-forget.
pub trait CandidateSink: Send + Sync {
    fn candidate_peer(&self, info_hash: InfoHash, addr: SocketAddr);
}
