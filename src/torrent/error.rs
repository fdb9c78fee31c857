use thiserror::Error;

/// Errors raised while building a [`Torrent`](super::Torrent) description.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TorrentError {
    /// The info hash is not 20 bytes (or 40 hex characters).
    #[error("invalid info hash length")]
    InvalidInfoHashLength,

    /// The info hash is not valid hexadecimal.
    #[error("invalid info hash hex: {0}")]
    InvalidHex(String),

    /// The piece length is zero.
    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    /// Piece offsets and lengths travel as `u32` on the wire.
    #[error("piece length {0} does not fit in 32 bits")]
    PieceLengthTooLarge(u64),

    /// Piece indices travel as `u32` on the wire.
    #[error("{0} pieces exceed the 32-bit piece index")]
    TooManyPieces(u64),

    /// The torrent has no content.
    #[error("torrent has no content")]
    Empty,

    /// The number of piece hashes does not match the content length.
    #[error("expected {expected} piece hashes, got {got}")]
    PieceCountMismatch { expected: usize, got: usize },

    /// A file's offset does not continue where the previous file ended.
    #[error("file {index} starts at {offset}, expected {expected}")]
    FileGap {
        index: usize,
        offset: u64,
        expected: u64,
    },
}
