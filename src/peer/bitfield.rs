use bytes::Bytes;

use super::error::PeerError;

/// A bitfield representing which pieces a peer has.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Parses a bitfield received on the wire.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes long and
    /// every spare bit past the last piece must be clear.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(PeerError::InvalidMessage(format!(
                "bitfield is {} bytes, expected {}",
                bytes.len(),
                expected
            )));
        }

        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        if let Some(&last) = bf.bits.last() {
            if last & !bf.last_byte_mask() != 0 {
                return Err(PeerError::InvalidMessage("bitfield spare bits set".into()));
            }
        }
        Ok(bf)
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        let mask = bf.last_byte_mask();
        if let Some(last) = bf.bits.last_mut() {
            *last &= mask;
        }
        bf
    }

    /// Returns true if the piece at the given index is available.
    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit for the piece at the given index.
    pub fn set_piece(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    /// Clears the bit for the piece at the given index.
    pub fn clear_piece(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Returns the number of pieces that are available.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if all pieces are available.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no pieces are available.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates over the indices of available pieces.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has_piece(i))
    }

    /// Returns true if `self` has at least one piece that `ours` lacks.
    pub fn has_any_missing_from(&self, ours: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(ours.bits.iter())
            .any(|(theirs, ours)| theirs & !ours != 0)
    }

    fn last_byte_mask(&self) -> u8 {
        match self.piece_count % 8 {
            0 => 0xFF,
            used => 0xFFu8 << (8 - used),
        }
    }
}
