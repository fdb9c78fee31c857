use async_trait::async_trait;
use bytes::Bytes;

use super::error::StorageError;
use crate::torrent::PieceInfo;

/// Byte-range access to a torrent's content, addressed by piece.
///
/// This is the storage collaborator behind [`PieceStore`](super::PieceStore).
/// Implementations only move bytes; bounds checks, hashing and the decision
/// of what may be read are made by the store. Failures surface as
/// [`StorageError`] and are never retried by the engine.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Reads `length` bytes starting `offset` bytes into `piece`.
    async fn read(&self, piece: &PieceInfo, offset: u32, length: u32)
        -> Result<Bytes, StorageError>;

    /// Writes `data` starting `offset` bytes into `piece`.
    async fn write(&self, piece: &PieceInfo, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Persists buffered writes.
    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Releases resources that have gone unused for a while, such as open
    /// file handles. The swarm calls this periodically.
    async fn release_idle(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
