use super::tracker::PieceTracker;
use crate::constants::MAX_ENDGAME_OWNERS;
use crate::peer::{Bitfield, BlockRequest, PeerKey};

/// Chooses which blocks to request from a peer.
///
/// Pieces the peer has are visited rarest first (fewest advertising peers),
/// ties broken by ascending index, and their open blocks are taken in
/// ascending offset order. In end-game, blocks already in flight on other
/// peers may be requested again, up to `max_endgame_owners` holders per
/// block and never twice from the same peer.
///
/// Selection marks the chosen blocks as requested in the same call, so two
/// connections can never be handed the same open block.
#[derive(Debug, Clone, Copy)]
pub struct PieceSelector {
    max_endgame_owners: usize,
}

impl Default for PieceSelector {
    fn default() -> Self {
        Self {
            max_endgame_owners: MAX_ENDGAME_OWNERS,
        }
    }
}

impl PieceSelector {
    pub fn new(max_endgame_owners: usize) -> Self {
        Self { max_endgame_owners }
    }

    /// Picks up to `count` blocks for `peer` and marks them requested.
    ///
    /// Returns an empty list when the peer has nothing useful.
    pub fn select(
        &self,
        tracker: &mut PieceTracker,
        peer: PeerKey,
        peer_pieces: &Bitfield,
        count: usize,
    ) -> Vec<BlockRequest> {
        let mut picked = Vec::new();
        if count == 0 {
            return picked;
        }

        let mut candidates: Vec<u32> = peer_pieces
            .pieces()
            .map(|i| i as u32)
            .filter(|&i| tracker.state(i).is_some_and(|s| s.is_requestable()))
            .collect();
        candidates.sort_by_key(|&i| (tracker.rarity(i), i));

        'fresh: for piece in candidates {
            for block in tracker.open_blocks(piece) {
                let req = tracker.block_request(piece, block);
                if tracker.mark_requested(req, peer) {
                    picked.push(req);
                    if picked.len() == count {
                        break 'fresh;
                    }
                }
            }
        }

        if picked.len() < count && tracker.in_endgame() {
            self.select_endgame(tracker, peer, peer_pieces, count, &mut picked);
        }

        picked
    }

    fn select_endgame(
        &self,
        tracker: &mut PieceTracker,
        peer: PeerKey,
        peer_pieces: &Bitfield,
        count: usize,
        picked: &mut Vec<BlockRequest>,
    ) {
        let mut pieces: Vec<u32> = peer_pieces
            .pieces()
            .map(|i| i as u32)
            .filter(|&i| !tracker.is_complete(i))
            .collect();
        pieces.sort_by_key(|&i| (tracker.rarity(i), i));

        for piece in pieces {
            for block in tracker.duplicable_blocks(piece, peer, self.max_endgame_owners) {
                let req = tracker.block_request(piece, block);
                if tracker.mark_requested(req, peer) {
                    tracing::trace!(%peer, piece, offset = req.offset, "end-game duplicate request");
                    picked.push(req);
                    if picked.len() == count {
                        return;
                    }
                }
            }
        }
    }
}
