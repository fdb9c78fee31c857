//! Piece state tracking and block selection.
//!
//! [`PieceTracker`] is the authoritative record of a torrent's pieces: which
//! are complete, which blocks are in flight on which peers, and how rare
//! each piece is among connected peers. [`PieceSelector`] reads and updates
//! it to hand out block requests rarest-first, switching to end-game
//! duplication near completion.
//!
//! A piece goes through these states:
//!
//! ```text
//! Missing ──request──▶ Requested ──all blocks stored──▶ Verifying ──hash ok──▶ Complete
//!    ▲                     │                                 │
//!    └──── storage error ──┘                                 └──hash bad──▶ Corrupt ──request──▶ Requested
//! ```

mod selector;
mod state;
mod tracker;

pub use selector::PieceSelector;
pub use state::{BlockOutcome, BlockSlot, Discard, PartialPiece, PieceState, VerifyOutcome};
pub use tracker::PieceTracker;
