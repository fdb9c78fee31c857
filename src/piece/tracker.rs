use std::sync::Arc;

use super::state::{BlockOutcome, BlockSlot, Discard, PartialPiece, PieceState, VerifyOutcome};
use crate::peer::{block_count, block_index, block_length, Bitfield, BlockRequest, PeerKey};
use crate::storage::Verification;
use crate::torrent::Torrent;

/// Authoritative piece and block bookkeeping of one torrent.
///
/// The tracker records which pieces are complete, which blocks are in flight
/// and on which peers, and how many connected peers advertise each piece. It
/// does no I/O; the swarm drives it from short critical sections and performs
/// the storage calls in between.
///
/// A block moves `Open -> InFlight -> Writing -> Received`. Only the first
/// copy of a block is written: [`accept_block`](Self::accept_block) moves it
/// to `Writing` and hands back the other owners, which must be sent a cancel.
#[derive(Debug)]
pub struct PieceTracker {
    torrent: Arc<Torrent>,
    block_size: u32,
    endgame_threshold: f64,
    states: Vec<PieceState>,
    have: Bitfield,
    availability: Vec<u32>,
    completed_bytes: u64,
    seeding_reported: bool,
}

impl PieceTracker {
    pub fn new(torrent: Arc<Torrent>, block_size: u32, endgame_threshold: f64) -> Self {
        let piece_count = torrent.piece_count();
        Self {
            torrent,
            block_size,
            endgame_threshold,
            states: vec![PieceState::Missing; piece_count],
            have: Bitfield::new(piece_count),
            availability: vec![0; piece_count],
            completed_bytes: 0,
            seeding_reported: false,
        }
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn piece_count(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, piece: u32) -> Option<&PieceState> {
        self.states.get(piece as usize)
    }

    /// Our own bitfield, as advertised to peers.
    pub fn bitfield(&self) -> &Bitfield {
        &self.have
    }

    /// Marks pieces found valid on disk as complete.
    ///
    /// Only used before any peer is connected; completion here never
    /// produces a seeding transition event.
    pub fn load_verified(&mut self, valid: &[bool]) {
        for (index, _) in valid.iter().enumerate().filter(|(_, ok)| **ok) {
            if index < self.states.len() && self.states[index] != PieceState::Complete {
                self.set_complete(index);
            }
        }
        if self.is_seeding() {
            self.seeding_reported = true;
        }
    }

    fn set_complete(&mut self, index: usize) {
        self.states[index] = PieceState::Complete;
        self.have.set_piece(index);
        self.completed_bytes += self.torrent.pieces()[index].length;
    }

    fn piece_length(&self, piece: u32) -> u64 {
        self.torrent.piece(piece).map_or(0, |p| p.length)
    }

    pub fn block_count(&self, piece: u32) -> u32 {
        block_count(self.piece_length(piece), self.block_size)
    }

    /// The request for block `block` of `piece`.
    pub fn block_request(&self, piece: u32, block: u32) -> BlockRequest {
        BlockRequest::new(
            piece,
            block * self.block_size,
            block_length(self.piece_length(piece), block, self.block_size),
        )
    }

    /// Locates the slot a request refers to, if it is a well-formed block.
    fn slot_index(&self, req: &BlockRequest) -> Option<usize> {
        let block = block_index(req.offset, self.block_size)?;
        if block >= self.block_count(req.piece) {
            return None;
        }
        let expected = block_length(self.piece_length(req.piece), block, self.block_size);
        (req.length == expected).then_some(block as usize)
    }

    /// Records that `req` was sent to `peer`.
    ///
    /// Returns false if the block cannot be requested from that peer: the
    /// piece is complete or being verified, the block has already arrived,
    /// or the peer already holds it.
    pub fn mark_requested(&mut self, req: BlockRequest, peer: PeerKey) -> bool {
        let Some(slot_index) = self.slot_index(&req) else {
            return false;
        };
        let block_count = self.block_count(req.piece);
        let state = &mut self.states[req.piece as usize];

        if matches!(state, PieceState::Missing | PieceState::Corrupt) {
            *state = PieceState::Requested(PartialPiece::new(block_count));
        }
        let PieceState::Requested(partial) = state else {
            return false;
        };

        let slot = &mut partial.blocks[slot_index];
        match slot {
            BlockSlot::Open => {
                *slot = BlockSlot::InFlight(vec![peer]);
                true
            }
            BlockSlot::InFlight(owners) if !owners.contains(&peer) => {
                owners.push(peer);
                true
            }
            _ => false,
        }
    }

    /// Peers currently holding `req` in flight.
    pub fn owners(&self, req: &BlockRequest) -> &[PeerKey] {
        let Some(slot_index) = self.slot_index(req) else {
            return &[];
        };
        match &self.states[req.piece as usize] {
            PieceState::Requested(partial) => match &partial.blocks[slot_index] {
                BlockSlot::InFlight(owners) => owners.as_slice(),
                _ => &[],
            },
            _ => &[],
        }
    }

    /// Claims an arriving block for writing.
    ///
    /// The first copy from a peer that was asked for it wins. On success the
    /// other peers that still have the block in flight are returned so the
    /// caller can cancel it there.
    pub fn accept_block(&mut self, req: &BlockRequest, peer: PeerKey) -> Result<Vec<PeerKey>, Discard> {
        let slot_index = self.slot_index(req).ok_or(Discard::Misaligned)?;
        let partial = match &mut self.states[req.piece as usize] {
            PieceState::Complete => return Err(Discard::Complete),
            PieceState::Verifying => return Err(Discard::Verifying),
            PieceState::Missing | PieceState::Corrupt => return Err(Discard::NotRequested),
            PieceState::Requested(partial) => partial,
        };

        let slot = &mut partial.blocks[slot_index];
        match slot {
            BlockSlot::InFlight(owners) if owners.contains(&peer) => {
                let others = owners.iter().copied().filter(|o| *o != peer).collect();
                *slot = BlockSlot::Writing;
                Ok(others)
            }
            BlockSlot::Writing | BlockSlot::Received => Err(Discard::Duplicate),
            _ => Err(Discard::NotRequested),
        }
    }

    /// Records that an accepted block is stored.
    ///
    /// Once every block of the piece is stored the piece enters `Verifying`
    /// and the caller must hash it. No other caller can reach that state for
    /// the same piece, so at most one verification runs per piece.
    pub fn mark_block_received(&mut self, req: &BlockRequest) -> BlockOutcome {
        let Some(slot_index) = self.slot_index(req) else {
            return BlockOutcome::Stale;
        };
        let state = &mut self.states[req.piece as usize];
        let PieceState::Requested(partial) = state else {
            return BlockOutcome::Stale;
        };
        if partial.blocks[slot_index] != BlockSlot::Writing {
            return BlockOutcome::Stale;
        }

        partial.blocks[slot_index] = BlockSlot::Received;
        if partial.received() == partial.blocks.len() {
            *state = PieceState::Verifying;
            BlockOutcome::ReadyToVerify
        } else {
            BlockOutcome::Partial
        }
    }

    /// Applies the hash check of a piece in `Verifying`.
    ///
    /// A mismatch discards every block; the piece becomes `Corrupt` and can
    /// be requested again from any peer.
    pub fn finish_verification(&mut self, piece: u32, verification: Verification) -> VerifyOutcome {
        let index = piece as usize;
        if self.states.get(index) != Some(&PieceState::Verifying) {
            return VerifyOutcome::Ignored;
        }

        match verification {
            Verification::Verified => {
                self.set_complete(index);
                let became_seeding = self.is_seeding() && !self.seeding_reported;
                if became_seeding {
                    self.seeding_reported = true;
                }
                VerifyOutcome::Completed { became_seeding }
            }
            Verification::Mismatch => {
                self.states[index] = PieceState::Corrupt;
                VerifyOutcome::Corrupt
            }
        }
    }

    /// Resets a piece after a storage failure.
    ///
    /// Every block is discarded and the piece returns to `Missing`. Returns
    /// the in-flight requests that should be cancelled, with their owners.
    pub fn abort_piece(&mut self, piece: u32) -> Vec<(BlockRequest, PeerKey)> {
        let index = piece as usize;
        let Some(state) = self.states.get(index) else {
            return Vec::new();
        };
        if *state == PieceState::Complete {
            return Vec::new();
        }

        let mut cancels = Vec::new();
        if let PieceState::Requested(partial) = state {
            for (block, slot) in partial.blocks.iter().enumerate() {
                if let BlockSlot::InFlight(owners) = slot {
                    let req = self.block_request(piece, block as u32);
                    cancels.extend(owners.iter().map(|owner| (req, *owner)));
                }
            }
        }
        self.states[index] = PieceState::Missing;
        cancels
    }

    /// Returns every block `peer` had in flight to the pool.
    pub fn release_peer(&mut self, peer: PeerKey) {
        for state in &mut self.states {
            if let PieceState::Requested(partial) = state {
                for slot in &mut partial.blocks {
                    release_slot(slot, peer);
                }
                state.settle();
            }
        }
    }

    /// Returns specific blocks held by `peer` to the pool.
    pub fn release_blocks(&mut self, peer: PeerKey, requests: &[BlockRequest]) {
        for req in requests {
            let Some(slot_index) = self.slot_index(req) else {
                continue;
            };
            let state = &mut self.states[req.piece as usize];
            if let PieceState::Requested(partial) = state {
                release_slot(&mut partial.blocks[slot_index], peer);
                state.settle();
            }
        }
    }

    /// Blocks of `piece` that nobody has requested, in ascending order.
    pub fn open_blocks(&self, piece: u32) -> Vec<u32> {
        match self.state(piece) {
            Some(PieceState::Missing | PieceState::Corrupt) => (0..self.block_count(piece)).collect(),
            Some(PieceState::Requested(partial)) => partial
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, slot)| matches!(slot, BlockSlot::Open))
                .map(|(i, _)| i as u32)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Blocks of `piece` in flight on other peers that `peer` may duplicate.
    pub fn duplicable_blocks(&self, piece: u32, peer: PeerKey, max_owners: usize) -> Vec<u32> {
        match self.state(piece) {
            Some(PieceState::Requested(partial)) => partial
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, slot)| match slot {
                    BlockSlot::InFlight(owners) => owners.len() < max_owners && !owners.contains(&peer),
                    _ => false,
                })
                .map(|(i, _)| i as u32)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// A peer advertised its full bitfield.
    pub fn peer_bitfield_added(&mut self, bitfield: &Bitfield) {
        for index in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(index) {
                *count += 1;
            }
        }
    }

    /// A peer announced one more piece.
    pub fn peer_has(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// A peer with `bitfield` disconnected.
    pub fn peer_removed(&mut self, bitfield: &Bitfield) {
        for index in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Number of connected peers advertising `piece`.
    pub fn rarity(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    pub fn is_complete(&self, piece: u32) -> bool {
        self.have.has_piece(piece as usize)
    }

    pub fn completion_ratio(&self) -> f64 {
        if self.states.is_empty() {
            return 1.0;
        }
        self.have.count() as f64 / self.states.len() as f64
    }

    pub fn is_seeding(&self) -> bool {
        self.have.is_complete()
    }

    /// Whether duplicate requests for in-flight blocks are allowed.
    pub fn in_endgame(&self) -> bool {
        !self.is_seeding() && self.completion_ratio() >= self.endgame_threshold
    }

    /// True if a peer with `bitfield` has a piece we still need.
    pub fn wants_from(&self, bitfield: &Bitfield) -> bool {
        bitfield.has_any_missing_from(&self.have)
    }

    /// Bytes not yet verified.
    pub fn left_bytes(&self) -> u64 {
        self.torrent.total_length() - self.completed_bytes
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }
}

fn release_slot(slot: &mut BlockSlot, peer: PeerKey) {
    if let BlockSlot::InFlight(owners) = slot {
        owners.retain(|owner| *owner != peer);
        if owners.is_empty() {
            *slot = BlockSlot::Open;
        }
    }
}
