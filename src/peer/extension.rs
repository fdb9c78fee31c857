use std::net::SocketAddr;

use bytes::Bytes;

use crate::torrent::InfoHash;

/// Receives extension protocol (BEP-10) messages.
///
/// The engine only frames extended messages; their payloads are handed to the
/// handler unparsed. A handler may answer with a message of its own, which is
/// sent back on the same connection.
pub trait ExtensionHandler: Send + Sync {
    fn on_message(
        &self,
        info_hash: InfoHash,
        peer: SocketAddr,
        id: u8,
        payload: Bytes,
    ) -> Option<(u8, Bytes)>;
}

/// Drops every extended message.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreExtensions;

impl ExtensionHandler for IgnoreExtensions {
    fn on_message(&self, _: InfoHash, peer: SocketAddr, id: u8, payload: Bytes) -> Option<(u8, Bytes)> {
        tracing::trace!(%peer, id, len = payload.len(), "ignoring extended message");
        None
    }
}
