use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::constants::MAX_PENDING_CANDIDATES;
use crate::peer::{BlockRequest, ChokingState, PeerError, PeerId, PeerKey, TransferStats};

/// Instructions from the swarm to a connection task.
///
/// The queue is unbounded: a command is only lost when its connection is
/// already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerCommand {
    Choke,
    Unchoke,
    /// A piece was verified; announce it.
    Have(u32),
    /// Another peer delivered this block first.
    Cancel(BlockRequest),
    /// Top up the request pipeline.
    Refill,
    Close,
}

/// What the swarm knows about one connection.
#[derive(Debug)]
pub(crate) struct PeerEntry {
    pub addr: SocketAddr,
    /// We dialed the peer.
    pub outbound: bool,
    /// Set once the handshake completed.
    pub peer_id: Option<PeerId>,
    pub choking: ChokingState,
    pub stats: TransferStats,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerEntry {
    pub fn is_active(&self) -> bool {
        self.peer_id.is_some()
    }
}

/// Outcome of offering a candidate address.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Dial now; the entry is reserved under this key.
    Dial(PeerKey, mpsc::UnboundedReceiver<PeerCommand>),
    /// No free slot; the address waits in the pending queue.
    Queued,
    /// Connected, pending, or attempted recently.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    DuplicateAddress,
    AtCapacity,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::DuplicateAddress => f.write_str("address already connected"),
            Rejection::AtCapacity => f.write_str("connection limit reached"),
        }
    }
}

/// Connections of one swarm, keyed by [`PeerKey`].
///
/// Entries are created when a dial starts or an inbound connection is
/// accepted, so connections still handshaking count against
/// `max_connections`.
pub(crate) struct PeerRegistry {
    our_id: PeerId,
    max_connections: usize,
    backoff: Duration,
    next_key: u64,
    peers: BTreeMap<PeerKey, PeerEntry>,
    by_addr: HashMap<SocketAddr, PeerKey>,
    attempts: HashMap<SocketAddr, Instant>,
    pending: VecDeque<SocketAddr>,
}

impl PeerRegistry {
    pub fn new(our_id: PeerId, max_connections: usize, backoff: Duration) -> Self {
        Self {
            our_id,
            max_connections,
            backoff,
            next_key: 0,
            peers: BTreeMap::new(),
            by_addr: HashMap::new(),
            attempts: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn active_count(&self) -> usize {
        self.peers.values().filter(|entry| entry.is_active()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, key: PeerKey) -> Option<&PeerEntry> {
        self.peers.get(&key)
    }

    pub fn get_mut(&mut self, key: PeerKey) -> Option<&mut PeerEntry> {
        self.peers.get_mut(&key)
    }

    /// Handshaken connections in ascending key order.
    pub fn active(&self) -> impl Iterator<Item = (PeerKey, &PeerEntry)> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.is_active())
            .map(|(key, entry)| (*key, entry))
    }

    fn recently_attempted(&self, addr: &SocketAddr, now: Instant) -> bool {
        self.attempts
            .get(addr)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.backoff)
    }

    fn insert(&mut self, addr: SocketAddr, outbound: bool) -> (PeerKey, mpsc::UnboundedReceiver<PeerCommand>) {
        let key = PeerKey(self.next_key);
        self.next_key += 1;

        let (commands, rx) = mpsc::unbounded_channel();
        self.peers.insert(
            key,
            PeerEntry {
                addr,
                outbound,
                peer_id: None,
                choking: ChokingState::default(),
                stats: TransferStats::default(),
                commands,
            },
        );
        self.by_addr.insert(addr, key);
        (key, rx)
    }

    /// Offers an address from discovery.
    pub fn candidate(&mut self, addr: SocketAddr, now: Instant) -> Admission {
        let backoff = self.backoff;
        self.attempts
            .retain(|_, at| now.saturating_duration_since(*at) < backoff);

        if self.by_addr.contains_key(&addr)
            || self.pending.contains(&addr)
            || self.recently_attempted(&addr, now)
        {
            return Admission::Ignored;
        }

        if self.peers.len() >= self.max_connections {
            if self.pending.len() >= MAX_PENDING_CANDIDATES {
                return Admission::Ignored;
            }
            self.pending.push_back(addr);
            return Admission::Queued;
        }

        self.attempts.insert(addr, now);
        let (key, rx) = self.insert(addr, true);
        Admission::Dial(key, rx)
    }

    /// Pops the next queued address that may be dialed, if a slot is free.
    pub fn next_pending(&mut self, now: Instant) -> Option<(PeerKey, SocketAddr, mpsc::UnboundedReceiver<PeerCommand>)> {
        while self.peers.len() < self.max_connections {
            let addr = self.pending.pop_front()?;
            if self.by_addr.contains_key(&addr) || self.recently_attempted(&addr, now) {
                continue;
            }
            self.attempts.insert(addr, now);
            let (key, rx) = self.insert(addr, true);
            return Some((key, addr, rx));
        }
        None
    }

    /// Reserves an entry for a connection the peer opened.
    pub fn admit_inbound(&mut self, addr: SocketAddr) -> Result<(PeerKey, mpsc::UnboundedReceiver<PeerCommand>), Rejection> {
        if self.by_addr.contains_key(&addr) {
            return Err(Rejection::DuplicateAddress);
        }
        if self.peers.len() >= self.max_connections {
            return Err(Rejection::AtCapacity);
        }
        Ok(self.insert(addr, false))
    }

    fn initiator(&self, outbound: bool, remote: PeerId) -> PeerId {
        if outbound {
            self.our_id
        } else {
            remote
        }
    }

    /// Records a completed handshake.
    ///
    /// When another connection to the same peer-id exists, the one initiated
    /// by the lower peer-id survives; both ends apply the same rule and keep
    /// the same socket. Returns the displaced connection, if any, or
    /// `DuplicateConnection` if this one loses.
    pub fn activate(&mut self, key: PeerKey, peer_id: PeerId) -> Result<Option<PeerKey>, PeerError> {
        if peer_id == self.our_id {
            return Err(PeerError::SelfConnection);
        }
        let outbound = self
            .peers
            .get(&key)
            .map(|entry| entry.outbound)
            .ok_or(PeerError::ConnectionClosed)?;

        let rival = self
            .peers
            .iter()
            .find(|(other, entry)| **other != key && entry.peer_id == Some(peer_id))
            .map(|(other, entry)| (*other, entry.outbound));

        let displaced = match rival {
            None => None,
            Some((rival_key, rival_outbound)) => {
                let ours = self.initiator(outbound, peer_id);
                let theirs = self.initiator(rival_outbound, peer_id);
                if ours >= theirs {
                    return Err(PeerError::DuplicateConnection);
                }
                if let Some(entry) = self.peers.get_mut(&rival_key) {
                    entry.peer_id = None;
                }
                Some(rival_key)
            }
        };

        if let Some(entry) = self.peers.get_mut(&key) {
            entry.peer_id = Some(peer_id);
        }
        Ok(displaced)
    }

    pub fn remove(&mut self, key: PeerKey) -> Option<PeerEntry> {
        let entry = self.peers.remove(&key)?;
        if self.by_addr.get(&entry.addr) == Some(&key) {
            self.by_addr.remove(&entry.addr);
        }
        Some(entry)
    }

    /// Queues a command for one connection. Returns `false` if the
    /// connection is unknown or its task has ended.
    pub fn send(&self, key: PeerKey, command: PeerCommand) -> bool {
        let Some(entry) = self.peers.get(&key) else {
            return false;
        };
        if entry.commands.send(command).is_err() {
            tracing::trace!(peer = %entry.addr, ?command, "peer command to closed connection");
            return false;
        }
        true
    }

    /// Queues a command for every handshaken connection.
    pub fn broadcast(&self, command: PeerCommand) {
        for (key, _) in self.active() {
            self.send(key, command);
        }
    }

    /// Closes every connection.
    pub fn close_all(&self) {
        for key in self.peers.keys() {
            self.send(*key, PeerCommand::Close);
        }
    }
}
