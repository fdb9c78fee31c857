use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::constants::{MAX_MESSAGE_SIZE, READ_BUFFER_SIZE, WRITE_TIMEOUT};

/// Length-prefixed message framing over an ordered byte stream.
///
/// Reads are cancel-safe: bytes already received stay buffered if a
/// [`receive_message`](Self::receive_message) future is dropped, and the
/// next call picks up where the last one stopped. Inbound silence is not
/// timed out here; the owner of the transport decides how long to wait.
pub struct PeerTransport<S = TcpStream> {
    stream: S,
    read_buf: BytesMut,
}

impl<S> PeerTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.stream.write_all(data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    async fn fill(&mut self, needed: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < needed {
            self.read_buf.reserve(needed - self.read_buf.len());
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.write(&handshake.encode()).await
    }

    /// Reads exactly one handshake. Bytes that follow it stay buffered.
    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        self.fill(1).await?;
        if self.read_buf[0] != 19 {
            return Err(PeerError::InvalidHandshake);
        }
        self.fill(HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        tracing::trace!(kind = message.kind(), "sending message");
        self.write(&message.encode()).await
    }

    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        self.fill(4).await?;

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "message too large: {}",
                length
            )));
        }

        self.fill(4 + length).await?;
        let data = self.read_buf.split_to(4 + length);
        Message::decode(data.freeze())
    }

    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl PeerTransport<TcpStream> {
    /// Connects to `addr`, giving up after `connect_timeout`.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, PeerError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}
