//! Peer wire protocol (BEP-3).
//!
//! Framing and codec for handshakes and messages, the per-connection
//! protocol state machine, the choking policy and transfer accounting.
//!
//! [`PeerConnection`] performs no I/O. A session task owns the
//! [`PeerTransport`], reads messages from it, feeds them to the connection
//! and writes whatever the connection and the swarm decide to send.
//! Extension protocol (BEP-10) payloads are not interpreted; they are passed
//! to an [`ExtensionHandler`].

mod bitfield;
mod block;
mod choking;
mod connection;
mod error;
mod extension;
mod message;
mod peer_id;
mod stats;
mod transport;

pub use bitfield::Bitfield;
pub use block::{block_count, block_index, block_length, Block, BlockRequest};
pub use choking::{ChokeDecision, ChokingPolicy, ChokingState, PeerSnapshot};
pub use connection::{ConnectionState, Inbound, PeerConnection};
pub use error::PeerError;
pub use extension::{ExtensionHandler, IgnoreExtensions};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::{PeerId, PeerKey};
pub use stats::{RateMeter, TransferStats};
pub use transport::PeerTransport;
