use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The piece has not been verified yet, so its bytes must not be served.
    #[error("piece {0} is not available")]
    NotAvailable(u32),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block: piece {piece}, offset {offset}, length {length}")]
    InvalidBlockOffset { piece: u32, offset: u32, length: u32 },

    /// Writes into a verified piece are refused.
    #[error("piece {0} is already complete")]
    PieceComplete(u32),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
