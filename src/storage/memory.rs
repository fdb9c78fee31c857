use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::backend::PieceStorage;
use super::error::StorageError;
use crate::torrent::PieceInfo;

/// Content held in memory, zero-filled until written.
///
/// Useful for tests and for embedders that stream content elsewhere.
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// Creates empty storage for `total_length` bytes of content.
    pub fn new(total_length: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; total_length as usize]),
        }
    }

    /// Creates storage that already holds `content`, e.g. for a seeder.
    pub fn with_content(content: impl Into<Vec<u8>>) -> Self {
        Self {
            data: RwLock::new(content.into()),
        }
    }

    /// Returns a copy of the whole content.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.read())
    }

    fn range(&self, piece: &PieceInfo, offset: u32, length: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let start = (piece.offset + offset as u64) as usize;
        let end = start + length;
        if end > self.data.read().len() {
            return Err(StorageError::InvalidBlockOffset {
                piece: piece.index,
                offset,
                length: length as u32,
            });
        }
        Ok(start..end)
    }
}

#[async_trait]
impl PieceStorage for MemoryStorage {
    async fn read(&self, piece: &PieceInfo, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        let range = self.range(piece, offset, length as usize)?;
        Ok(Bytes::copy_from_slice(&self.data.read()[range]))
    }

    async fn write(&self, piece: &PieceInfo, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let range = self.range(piece, offset, data.len())?;
        self.data.write()[range].copy_from_slice(data);
        Ok(())
    }
}
