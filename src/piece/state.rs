use crate::peer::PeerKey;

/// Progress of one block inside a piece being downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSlot {
    /// Not requested from anyone.
    Open,
    /// Requested; more than one owner only during end-game.
    InFlight(Vec<PeerKey>),
    /// The first copy arrived and is being written to storage.
    Writing,
    /// Stored.
    Received,
}

/// Blocks of a piece that has been at least partly requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialPiece {
    pub(super) blocks: Vec<BlockSlot>,
}

impl PartialPiece {
    pub(super) fn new(block_count: u32) -> Self {
        Self {
            blocks: vec![BlockSlot::Open; block_count as usize],
        }
    }

    pub fn blocks(&self) -> &[BlockSlot] {
        &self.blocks
    }

    pub fn received(&self) -> usize {
        self.blocks
            .iter()
            .filter(|slot| matches!(slot, BlockSlot::Received))
            .count()
    }

    pub fn has_open_blocks(&self) -> bool {
        self.blocks.iter().any(|slot| matches!(slot, BlockSlot::Open))
    }

    fn is_untouched(&self) -> bool {
        self.blocks.iter().all(|slot| matches!(slot, BlockSlot::Open))
    }
}

/// State of a piece as seen by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Requested(PartialPiece),
    /// All blocks stored, hash check in progress.
    Verifying,
    Complete,
    /// The last hash check failed and every block was discarded. Requestable
    /// exactly like `Missing`.
    Corrupt,
}

impl PieceState {
    /// True if blocks of this piece may be handed out.
    pub fn is_requestable(&self) -> bool {
        match self {
            PieceState::Missing | PieceState::Corrupt => true,
            PieceState::Requested(partial) => partial.has_open_blocks(),
            PieceState::Verifying | PieceState::Complete => false,
        }
    }

    pub(super) fn settle(&mut self) {
        if let PieceState::Requested(partial) = self {
            if partial.is_untouched() {
                *self = PieceState::Missing;
            }
        }
    }
}

/// Why an arriving block was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// The piece is already complete.
    Complete,
    /// The piece is being hashed.
    Verifying,
    /// The block was not requested from this peer.
    NotRequested,
    /// Another copy of the block was accepted first.
    Duplicate,
    /// Offset or length does not match a block of the piece.
    Misaligned,
}

/// What storing a block did to its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// More blocks are needed.
    Partial,
    /// Every block is stored; the piece must now be verified.
    ReadyToVerify,
    /// The piece was reset while the block was being written.
    Stale,
}

/// Result of applying a hash check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The piece is complete. `became_seeding` is set exactly once, for the
    /// piece that completed the torrent.
    Completed { became_seeding: bool },
    Corrupt,
    /// The piece was not awaiting verification.
    Ignored,
}
