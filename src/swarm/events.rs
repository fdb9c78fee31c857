use std::fmt;
use std::net::SocketAddr;

use crate::peer::PeerId;

/// Whether the swarm still downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Leeching,
    Seeding,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leeching => f.write_str("leeching"),
            Role::Seeding => f.write_str("seeding"),
        }
    }
}

/// Notifications published by a running swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    PeerConnected { addr: SocketAddr, peer_id: PeerId },
    PeerDisconnected { addr: SocketAddr, reason: String },
    PieceCompleted(u32),
    /// The piece failed its hash check and will be downloaded again.
    PieceCorrupt(u32),
    StorageFailure { piece: u32, error: String },
    /// Every piece is verified.
    Seeding,
    Stopped,
}

/// Snapshot of a swarm's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalState {
    pub role: Role,
    /// Connections that completed the handshake.
    pub peers: usize,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub completion: f64,
}
