use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::backend::PieceStorage;
use super::error::StorageError;
use crate::constants::RECHECK_BATCH_SIZE;
use crate::torrent::{PieceInfo, Torrent};

/// Result of hashing a piece against its expected SHA-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch,
}

/// Verified, piece-addressable access to a torrent's content.
///
/// Wraps a [`PieceStorage`] collaborator. Blocks of a piece can be written in
/// any order; once all of them are in, [`verify_piece`](Self::verify_piece)
/// hashes the stored bytes. Only verified pieces can be read back, so readers
/// never observe partially written or corrupt data.
pub struct PieceStore {
    torrent: Arc<Torrent>,
    storage: Arc<dyn PieceStorage>,
    verified: Vec<AtomicBool>,
}

impl PieceStore {
    pub fn new(torrent: Arc<Torrent>, storage: Arc<dyn PieceStorage>) -> Self {
        let verified = (0..torrent.piece_count())
            .map(|_| AtomicBool::new(false))
            .collect();
        Self {
            torrent,
            storage,
            verified,
        }
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    /// Returns true once the piece has passed verification.
    pub fn is_available(&self, piece_index: u32) -> bool {
        self.verified
            .get(piece_index as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn piece(&self, piece_index: u32) -> Result<&PieceInfo, StorageError> {
        self.torrent
            .piece(piece_index)
            .ok_or(StorageError::InvalidPieceIndex(piece_index))
    }

    fn check_block(&self, piece: &PieceInfo, offset: u32, length: u32) -> Result<(), StorageError> {
        if length == 0 || offset as u64 + length as u64 > piece.length {
            return Err(StorageError::InvalidBlockOffset {
                piece: piece.index,
                offset,
                length,
            });
        }
        Ok(())
    }

    /// Reads a block of a verified piece.
    ///
    /// Returns [`StorageError::NotAvailable`] for pieces that are not complete.
    pub async fn read_block(
        &self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        let piece = self.piece(piece_index)?;
        self.check_block(piece, offset, length)?;
        if !self.is_available(piece_index) {
            return Err(StorageError::NotAvailable(piece_index));
        }
        self.storage.read(piece, offset, length).await
    }

    /// Reads a whole verified piece.
    pub async fn read_piece(&self, piece_index: u32) -> Result<Bytes, StorageError> {
        let piece = self.piece(piece_index)?;
        if !self.is_available(piece_index) {
            return Err(StorageError::NotAvailable(piece_index));
        }
        self.storage.read(piece, 0, piece.length as u32).await
    }

    /// Writes a block of a piece that is not complete yet.
    pub async fn write_block(
        &self,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let piece = self.piece(piece_index)?;
        self.check_block(piece, offset, data.len() as u32)?;
        if self.is_available(piece_index) {
            return Err(StorageError::PieceComplete(piece_index));
        }
        self.storage.write(piece, offset, data).await
    }

    /// Hashes the stored bytes of a piece and compares them with the
    /// expected hash. A verified piece becomes readable.
    pub async fn verify_piece(&self, piece_index: u32) -> Result<Verification, StorageError> {
        let piece = self.piece(piece_index)?;
        let data = self.storage.read(piece, 0, piece.length as u32).await?;
        let expected = piece.hash;

        let hash = tokio::task::spawn_blocking(move || -> [u8; 20] { Sha1::digest(&data).into() })
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        let outcome = if hash == expected {
            Verification::Verified
        } else {
            Verification::Mismatch
        };
        self.verified[piece_index as usize].store(outcome == Verification::Verified, Ordering::Release);

        tracing::trace!(piece = piece_index, ?outcome, "piece hashed");
        Ok(outcome)
    }

    /// Verifies every piece, returning which ones hold valid data.
    ///
    /// Pieces whose data cannot be read count as invalid.
    pub async fn recheck(&self) -> Vec<bool> {
        let piece_count = self.torrent.piece_count();
        let mut results = vec![false; piece_count];
        let mut valid = 0usize;

        for batch_start in (0..piece_count).step_by(RECHECK_BATCH_SIZE) {
            let batch_end = (batch_start + RECHECK_BATCH_SIZE).min(piece_count);
            let batch = (batch_start..batch_end).map(|i| self.verify_piece(i as u32));

            for (i, result) in futures::future::join_all(batch).await.into_iter().enumerate() {
                let index = batch_start + i;
                results[index] = match result {
                    Ok(outcome) => outcome == Verification::Verified,
                    Err(e) => {
                        tracing::trace!(piece = index, error = %e, "piece unreadable during recheck");
                        false
                    }
                };
                valid += results[index] as usize;
            }
        }

        tracing::debug!(valid, total = piece_count, "recheck complete");
        results
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.storage.flush().await
    }

    pub async fn release_idle(&self) -> Result<(), StorageError> {
        self.storage.release_idle().await
    }
}
