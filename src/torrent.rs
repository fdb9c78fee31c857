//! Torrent description: info hash, piece layout and files.
//!
//! A [`Torrent`] is the immutable description the swarm engine works from.
//! It is created once, when a swarm starts, and shared as `Arc<Torrent>` by
//! every component of that swarm.
//!
//! Pieces all have the torrent's piece length except the last one, which
//! holds whatever content remains. Each piece carries the SHA-1 its bytes
//! must hash to before it may be marked complete.
//!
//! # Examples
//!
//! ```
//! use btswarm::torrent::Torrent;
//!
//! let data = vec![7u8; 40_000];
//! let torrent = Torrent::from_content("example.bin", &data, 16384).unwrap();
//!
//! assert_eq!(torrent.piece_count(), 3);
//! assert_eq!(torrent.piece(2).unwrap().length, 40_000 - 2 * 16384);
//! println!("info hash: {}", torrent.info_hash());
//! ```

mod bencode;
mod error;
mod file;
mod info_hash;

pub use error::TorrentError;
pub use file::{file_spans, FileEntry, FileSpan, PieceInfo};
pub use info_hash::InfoHash;

use sha1::{Digest, Sha1};

use self::bencode::Value;

/// Immutable description of a torrent's content.
#[derive(Debug, Clone)]
pub struct Torrent {
    info_hash: InfoHash,
    name: String,
    piece_length: u64,
    total_length: u64,
    pieces: Vec<PieceInfo>,
    files: Vec<FileEntry>,
}

impl Torrent {
    /// Builds a torrent from metadata supplied by the caller.
    ///
    /// `files` must be contiguous, starting at offset zero, and `piece_hashes`
    /// must hold exactly one hash per piece.
    pub fn new(
        info_hash: InfoHash,
        name: impl Into<String>,
        piece_length: u64,
        files: Vec<FileEntry>,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, TorrentError> {
        check_piece_length(piece_length)?;

        let mut expected_offset = 0u64;
        for (index, file) in files.iter().enumerate() {
            if file.offset != expected_offset {
                return Err(TorrentError::FileGap {
                    index,
                    offset: file.offset,
                    expected: expected_offset,
                });
            }
            expected_offset += file.length;
        }

        let total_length = expected_offset;
        if total_length == 0 {
            return Err(TorrentError::Empty);
        }

        let piece_count = total_length.div_ceil(piece_length);
        if piece_count > u64::from(u32::MAX) + 1 {
            return Err(TorrentError::TooManyPieces(piece_count));
        }
        let expected = piece_count as usize;
        if piece_hashes.len() != expected {
            return Err(TorrentError::PieceCountMismatch {
                expected,
                got: piece_hashes.len(),
            });
        }

        let pieces = piece_hashes
            .into_iter()
            .enumerate()
            .map(|(i, hash)| {
                let offset = i as u64 * piece_length;
                let length = piece_length.min(total_length - offset);
                PieceInfo::new(i as u32, hash, offset, length)
            })
            .collect();

        Ok(Self {
            info_hash,
            name: name.into(),
            piece_length,
            total_length,
            pieces,
            files,
        })
    }

    /// Describes `data` as a single-file torrent, hashing every piece.
    ///
    /// The info hash is the SHA-1 of the BEP-3 info dictionary, so it matches
    /// what other clients compute for the same single-file torrent.
    pub fn from_content(
        name: impl Into<String>,
        data: &[u8],
        piece_length: u64,
    ) -> Result<Self, TorrentError> {
        check_piece_length(piece_length)?;
        if data.is_empty() {
            return Err(TorrentError::Empty);
        }

        let name = name.into();
        let hashes: Vec<[u8; 20]> = data
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();

        // Bounded by check_piece_length.
        let info_hash = single_file_info_hash(&name, data.len(), piece_length as u32, &hashes);
        let files = vec![FileEntry::new(name.clone(), data.len() as u64, 0)];

        Self::new(info_hash, name, piece_length, files, hashes)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: u32) -> Option<&PieceInfo> {
        self.pieces.get(index as usize)
    }

    pub fn pieces(&self) -> &[PieceInfo] {
        &self.pieces
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }
}

fn check_piece_length(piece_length: u64) -> Result<(), TorrentError> {
    if piece_length == 0 {
        return Err(TorrentError::ZeroPieceLength);
    }
    if u32::try_from(piece_length).is_err() {
        return Err(TorrentError::PieceLengthTooLarge(piece_length));
    }
    Ok(())
}

fn single_file_info_hash(name: &str, length: usize, piece_length: u32, hashes: &[[u8; 20]]) -> InfoHash {
    let pieces: Vec<u8> = hashes.concat();
    let info = bencode::dict([
        ("length", Value::Integer(length as i64)),
        ("name", Value::string(name)),
        ("piece length", Value::Integer(i64::from(piece_length))),
        ("pieces", Value::Bytes(pieces.into())),
    ]);
    InfoHash::new(Sha1::digest(bencode::encode(&info)).into())
}
