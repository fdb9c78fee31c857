use std::cmp::Ordering;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};

use super::peer_id::PeerKey;

/// Choke and interest flags of one connection, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// What the choking round needs to know about one peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerSnapshot {
    pub key: PeerKey,
    pub interested: bool,
    pub am_choking: bool,
    /// Bytes per second we receive from the peer.
    pub download_rate: f64,
    /// Bytes per second we send to the peer.
    pub upload_rate: f64,
}

/// Outcome of one choking round.
///
/// `unchoke` and `choke` only list peers whose state changes; `unchoked` is
/// the full set of interested peers that end the round unchoked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChokeDecision {
    pub unchoke: Vec<PeerKey>,
    pub choke: Vec<PeerKey>,
    pub unchoked: Vec<PeerKey>,
    pub optimistic: Option<PeerKey>,
}

impl ChokeDecision {
    pub fn is_empty(&self) -> bool {
        self.unchoke.is_empty() && self.choke.is_empty()
    }
}

/// Tit-for-tat choking with one rotating optimistic slot.
///
/// Interested peers are ranked by the rate they give us (download rate while
/// leeching) or by the rate we reach them at (upload rate while seeding). The
/// best `unchoke_slots` are unchoked. One more interested peer is unchoked
/// optimistically and replaced every `optimistic_interval`. Peers that are not
/// interested are never touched.
pub struct ChokingPolicy {
    unchoke_slots: usize,
    optimistic_interval: Duration,
    optimistic_peer: Option<PeerKey>,
    last_rotation: Option<Instant>,
    rng: StdRng,
}

impl ChokingPolicy {
    pub fn new(unchoke_slots: usize, optimistic_interval: Duration) -> Self {
        Self::with_rng(unchoke_slots, optimistic_interval, StdRng::from_os_rng())
    }

    /// Creates a policy whose optimistic picks are reproducible.
    pub fn with_seed(unchoke_slots: usize, optimistic_interval: Duration, seed: u64) -> Self {
        Self::with_rng(unchoke_slots, optimistic_interval, StdRng::seed_from_u64(seed))
    }

    fn with_rng(unchoke_slots: usize, optimistic_interval: Duration, rng: StdRng) -> Self {
        Self {
            unchoke_slots,
            optimistic_interval,
            optimistic_peer: None,
            last_rotation: None,
            rng,
        }
    }

    pub fn optimistic_peer(&self) -> Option<PeerKey> {
        self.optimistic_peer
    }

    /// Forgets a disconnected peer.
    pub fn remove_peer(&mut self, key: PeerKey) {
        if self.optimistic_peer == Some(key) {
            self.optimistic_peer = None;
        }
    }

    /// Runs one choking round over `peers`.
    pub fn decide(&mut self, peers: &[PeerSnapshot], seeding: bool, now: Instant) -> ChokeDecision {
        let rate = |p: &PeerSnapshot| if seeding { p.upload_rate } else { p.download_rate };

        let mut candidates: Vec<&PeerSnapshot> = peers.iter().filter(|p| p.interested).collect();
        candidates.sort_by(|a, b| {
            rate(*b)
                .partial_cmp(&rate(*a))
                .unwrap_or(Ordering::Equal)
                .then(a.key.cmp(&b.key))
        });

        let mut unchoked: Vec<PeerKey> = candidates
            .iter()
            .take(self.unchoke_slots)
            .map(|p| p.key)
            .collect();

        let remaining: Vec<PeerKey> = candidates
            .iter()
            .skip(self.unchoke_slots)
            .map(|p| p.key)
            .collect();

        let due = self
            .last_rotation
            .map_or(true, |last| now.duration_since(last) >= self.optimistic_interval);
        let still_eligible = self
            .optimistic_peer
            .is_some_and(|key| remaining.contains(&key));

        if due || !still_eligible {
            self.optimistic_peer = if remaining.is_empty() {
                None
            } else {
                Some(remaining[self.rng.random_range(0..remaining.len())])
            };
            if due {
                self.last_rotation = Some(now);
            }
        }

        if let Some(key) = self.optimistic_peer {
            unchoked.push(key);
        }

        let mut decision = ChokeDecision {
            optimistic: self.optimistic_peer,
            ..Default::default()
        };
        for peer in candidates {
            let keep_open = unchoked.contains(&peer.key);
            if keep_open && peer.am_choking {
                decision.unchoke.push(peer.key);
            } else if !keep_open && !peer.am_choking {
                decision.choke.push(peer.key);
            }
        }
        decision.unchoked = unchoked;
        decision
    }
}
