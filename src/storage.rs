//! Piece storage and integrity verification.
//!
//! The engine reads and writes content through [`PieceStore`], which adds
//! hash verification and read gating on top of a [`PieceStorage`]
//! collaborator that only moves bytes.
//!
//! # Components
//!
//! - [`PieceStore`] - Block reads/writes, SHA-1 verification, recheck
//! - [`PieceStorage`] - The byte-range storage interface
//! - [`MemoryStorage`] - In-memory content
//! - [`FileStorage`] - Content laid out in files under a base directory
//!
//! # Examples
//!
//! ```
//! use btswarm::storage::{MemoryStorage, PieceStore, Verification};
//! use btswarm::torrent::Torrent;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let content = vec![42u8; 20_000];
//! let torrent = Arc::new(Torrent::from_content("data.bin", &content, 16384)?);
//! let store = PieceStore::new(torrent, Arc::new(MemoryStorage::new(20_000)));
//!
//! // Pieces cannot be read before they are verified.
//! store.write_block(0, 0, &content[..16384]).await?;
//! assert!(store.read_block(0, 0, 16384).await.is_err());
//!
//! assert_eq!(store.verify_piece(0).await?, Verification::Verified);
//! assert_eq!(store.read_block(0, 0, 4).await?.as_ref(), &[42, 42, 42, 42]);
//! # Ok(())
//! # }
//! ```
//!
//! # Failure model
//!
//! Storage faults are returned as [`StorageError`] and never retried here.
//! A failed write affects only the piece it targeted.

mod backend;
mod error;
mod file;
mod memory;
mod store;

pub use backend::PieceStorage;
pub use error::StorageError;
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use store::{PieceStore, Verification};
