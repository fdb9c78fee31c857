use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::bitfield::Bitfield;
use super::block::{Block, BlockRequest};
use super::choking::ChokingState;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use crate::constants::MAX_REQUEST_LENGTH;
use crate::torrent::Torrent;

/// Life cycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection in progress.
    Connecting,
    /// Connected, exchanging handshakes.
    Handshaking,
    /// Handshake complete, messages flow.
    Active,
    /// Shutting down, in-flight requests are being released.
    Closing,
    /// Gone for good.
    Closed,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Connecting, Closed)
                | (Handshaking, Active)
                | (Handshaking, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// What an inbound message means for the rest of the swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Nothing beyond the connection's own bookkeeping.
    Nothing,
    /// The peer choked us; these requests will not be answered.
    Choked { released: Vec<BlockRequest> },
    Unchoked,
    Interested,
    NotInterested,
    /// The peer announced a piece it did not have before.
    Have(u32),
    /// The peer sent its initial bitfield, now in [`PeerConnection::bitfield`].
    Bitfield,
    /// The peer wants a block from us.
    Request(BlockRequest),
    /// A block we asked for.
    Block(Block),
    Cancel(BlockRequest),
    Extended { id: u8, payload: Bytes },
}

/// Protocol state of one peer connection.
///
/// The state machine does no I/O: the session that owns the socket feeds it
/// every inbound [`Message`] and asks it which messages to send. It enforces
/// the wire rules that concern a single connection (message ordering, request
/// bounds, pipeline depth) and keeps the peer's bitfield and the set of our
/// outstanding requests.
#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    torrent: Arc<Torrent>,
    state: ConnectionState,
    peer_id: Option<PeerId>,
    choking: ChokingState,
    bitfield: Bitfield,
    pipeline_depth: usize,
    in_flight: HashSet<BlockRequest>,
    seen_message: bool,
    choked_requests: usize,
    last_message_at: Instant,
}

impl PeerConnection {
    pub fn new(addr: SocketAddr, torrent: Arc<Torrent>, pipeline_depth: usize) -> Self {
        let piece_count = torrent.piece_count();
        Self {
            addr,
            torrent,
            state: ConnectionState::Connecting,
            peer_id: None,
            choking: ChokingState::default(),
            bitfield: Bitfield::new(piece_count),
            pipeline_depth,
            in_flight: HashSet::new(),
            seen_message: false,
            choked_requests: 0,
            last_message_at: Instant::now(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn choking(&self) -> ChokingState {
        self.choking
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn last_message_at(&self) -> Instant {
        self.last_message_at
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_requested(&self, req: &BlockRequest) -> bool {
        self.in_flight.contains(req)
    }

    fn transition(&mut self, to: ConnectionState) -> Result<(), PeerError> {
        if !self.state.can_become(to) {
            return Err(PeerError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::trace!(peer = %self.addr, from = ?self.state, ?to, "connection state");
        self.state = to;
        Ok(())
    }

    /// The transport is connected; handshakes are about to be exchanged.
    pub fn begin_handshake(&mut self) -> Result<(), PeerError> {
        self.transition(ConnectionState::Handshaking)
    }

    /// Checks the remote handshake and activates the connection.
    pub fn complete_handshake(
        &mut self,
        theirs: &Handshake,
        our_peer_id: PeerId,
        now: Instant,
    ) -> Result<(), PeerError> {
        if self.state != ConnectionState::Handshaking {
            return Err(PeerError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Active,
            });
        }
        if theirs.info_hash != self.torrent.info_hash() {
            return Err(PeerError::InfoHashMismatch);
        }
        if theirs.peer_id == our_peer_id {
            return Err(PeerError::SelfConnection);
        }

        self.peer_id = Some(theirs.peer_id);
        self.last_message_at = now;
        self.transition(ConnectionState::Active)
    }

    /// Starts closing the connection, returning the requests it held.
    ///
    /// Closing before the handshake finished goes straight to `Closed`.
    pub fn close(&mut self) -> Vec<BlockRequest> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Handshaking => {
                self.state = ConnectionState::Closed;
            }
            ConnectionState::Active => self.state = ConnectionState::Closing,
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
        self.in_flight.drain().collect()
    }

    /// The socket is gone.
    pub fn finish_close(&mut self) -> Result<(), PeerError> {
        match self.state {
            ConnectionState::Closed => Ok(()),
            _ => self.transition(ConnectionState::Closed),
        }
    }

    /// True once the peer has been silent for longer than `idle_timeout`.
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_message_at) >= idle_timeout
    }

    /// Requests that may be added to the pipeline right now.
    pub fn request_slots(&self) -> usize {
        if self.state != ConnectionState::Active
            || self.choking.peer_choking
            || !self.choking.am_interested
        {
            return 0;
        }
        self.pipeline_depth.saturating_sub(self.in_flight.len())
    }

    /// Adds a request to the pipeline, returning the message to send.
    ///
    /// Returns `None` if the pipeline is full, the peer chokes us, or the
    /// block is already requested.
    pub fn request(&mut self, req: BlockRequest) -> Option<Message> {
        if self.request_slots() == 0 || !self.in_flight.insert(req) {
            return None;
        }
        Some(Message::request(req))
    }

    /// Withdraws an outstanding request.
    pub fn cancel(&mut self, req: &BlockRequest) -> Option<Message> {
        self.in_flight.remove(req).then(|| Message::cancel(*req))
    }

    /// Updates our interest, returning the message only if it changed.
    pub fn set_interested(&mut self, interested: bool) -> Option<Message> {
        if self.choking.am_interested == interested {
            return None;
        }
        self.choking.am_interested = interested;
        Some(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        })
    }

    /// Updates whether we choke the peer, returning the message only if it
    /// changed.
    pub fn set_choking(&mut self, choking: bool) -> Option<Message> {
        if self.choking.am_choking == choking {
            return None;
        }
        self.choking.am_choking = choking;
        self.choked_requests = 0;
        Some(if choking {
            Message::Choke
        } else {
            Message::Unchoke
        })
    }

    /// Applies an inbound message.
    ///
    /// Returns an error for protocol violations; the caller must then close
    /// the connection.
    pub fn on_message(&mut self, message: Message, now: Instant) -> Result<Inbound, PeerError> {
        if self.state != ConnectionState::Active {
            return Err(PeerError::Protocol(format!(
                "{} received while {:?}",
                message.kind(),
                self.state
            )));
        }

        self.last_message_at = now;
        let first = !self.seen_message;
        if !matches!(message, Message::KeepAlive) {
            self.seen_message = true;
        }

        match message {
            Message::KeepAlive | Message::Port(_) => Ok(Inbound::Nothing),
            Message::Choke => {
                self.choking.peer_choking = true;
                Ok(Inbound::Choked {
                    released: self.in_flight.drain().collect(),
                })
            }
            Message::Unchoke => {
                self.choking.peer_choking = false;
                Ok(Inbound::Unchoked)
            }
            Message::Interested => {
                self.choking.peer_interested = true;
                Ok(Inbound::Interested)
            }
            Message::NotInterested => {
                self.choking.peer_interested = false;
                Ok(Inbound::NotInterested)
            }
            Message::Have { piece } => {
                if piece as usize >= self.torrent.piece_count() {
                    return Err(PeerError::InvalidMessage(format!(
                        "have for piece {} of {}",
                        piece,
                        self.torrent.piece_count()
                    )));
                }
                if self.bitfield.has_piece(piece as usize) {
                    return Ok(Inbound::Nothing);
                }
                self.bitfield.set_piece(piece as usize);
                Ok(Inbound::Have(piece))
            }
            Message::Bitfield(bits) => {
                if !first {
                    return Err(PeerError::Protocol(
                        "bitfield must be the first message".into(),
                    ));
                }
                self.bitfield = Bitfield::from_bytes(&bits, self.torrent.piece_count())?;
                Ok(Inbound::Bitfield)
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                let req = BlockRequest::new(index, begin, length);
                self.check_request(&req)?;
                if self.choking.am_choking {
                    self.choked_requests += 1;
                    if self.choked_requests > self.pipeline_depth {
                        return Err(PeerError::Protocol(format!(
                            "{} requests while choked",
                            self.choked_requests
                        )));
                    }
                    tracing::trace!(peer = %self.addr, piece = index, "request while choked dropped");
                    return Ok(Inbound::Nothing);
                }
                Ok(Inbound::Request(req))
            }
            Message::Piece { index, begin, data } => {
                let req = BlockRequest::new(index, begin, data.len() as u32);
                if !self.in_flight.remove(&req) {
                    tracing::trace!(peer = %self.addr, piece = index, offset = begin, "unsolicited block discarded");
                    return Ok(Inbound::Nothing);
                }
                Ok(Inbound::Block(Block::new(index, begin, data)))
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => Ok(Inbound::Cancel(BlockRequest::new(index, begin, length))),
            Message::Extended { id, payload } => Ok(Inbound::Extended { id, payload }),
        }
    }

    fn check_request(&self, req: &BlockRequest) -> Result<(), PeerError> {
        if req.length == 0 || req.length > MAX_REQUEST_LENGTH {
            return Err(PeerError::Protocol(format!(
                "request length {} out of range",
                req.length
            )));
        }
        let piece = self.torrent.piece(req.piece).ok_or_else(|| {
            PeerError::Protocol(format!("request for unknown piece {}", req.piece))
        })?;
        if req.offset as u64 + req.length as u64 > piece.length {
            return Err(PeerError::Protocol(format!(
                "request {}+{} beyond piece {} of {} bytes",
                req.offset, req.length, req.piece, piece.length
            )));
        }
        Ok(())
    }
}
