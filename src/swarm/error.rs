use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::peer::PeerError;
use crate::storage::StorageError;
use crate::torrent::{InfoHash, TorrentError};

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("swarm already started")]
    AlreadyStarted,

    #[error("swarm stopped")]
    Stopped,

    #[error("unknown torrent {0}")]
    UnknownTorrent(InfoHash),

    #[error("torrent {0} already added")]
    DuplicateTorrent(InfoHash),
}
