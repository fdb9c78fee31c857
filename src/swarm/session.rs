use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, MissedTickBehavior};

use super::events::{Role, SwarmEvent};
use super::registry::PeerCommand;
use super::Shared;
use crate::peer::{
    Block, BlockRequest, Handshake, Inbound, Message, PeerConnection, PeerError, PeerKey,
    PeerTransport,
};
use crate::piece::{BlockOutcome, VerifyOutcome};

/// Dials `addr`, exchanges handshakes and runs the connection.
pub(crate) async fn run_outbound(
    shared: Arc<Shared>,
    key: PeerKey,
    addr: SocketAddr,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let mut conn = PeerConnection::new(addr, shared.torrent.clone(), shared.config.pipeline_depth);
    let mut shutdown = shared.shutdown.subscribe();

    let established = tokio::select! {
        result = timeout(shared.config.handshake_timeout, dial(&shared, &mut conn)) => {
            result.unwrap_or(Err(PeerError::Timeout))
        }
        _ = super::stopped(&mut shutdown) => Err(PeerError::ConnectionClosed),
    };

    match established {
        Ok(transport) => {
            Session::new(shared, key, conn, transport, commands)
                .run()
                .await
        }
        Err(e) => {
            tracing::debug!(peer = %addr, error = %e, "outbound connection failed");
            conn.close();
            shared.forget(key);
        }
    }
}

async fn dial(shared: &Shared, conn: &mut PeerConnection) -> Result<PeerTransport<TcpStream>, PeerError> {
    let mut transport = PeerTransport::connect(conn.addr(), shared.config.handshake_timeout).await?;
    conn.begin_handshake()?;
    transport
        .send_handshake(&Handshake::new(shared.torrent.info_hash(), shared.peer_id))
        .await?;
    let theirs = transport.receive_handshake().await?;
    conn.complete_handshake(&theirs, shared.peer_id, Instant::now())?;
    Ok(transport)
}

/// Answers a handshake already read from an accepted connection and runs
/// the connection.
pub(crate) async fn run_inbound<S>(
    shared: Arc<Shared>,
    key: PeerKey,
    addr: SocketAddr,
    mut transport: PeerTransport<S>,
    theirs: Handshake,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut conn = PeerConnection::new(addr, shared.torrent.clone(), shared.config.pipeline_depth);
    let answered = answer(&shared, &mut conn, &mut transport, &theirs).await;

    match answered {
        Ok(()) => {
            Session::new(shared, key, conn, transport, commands)
                .run()
                .await
        }
        Err(e) => {
            tracing::debug!(peer = %addr, error = %e, "inbound handshake rejected");
            conn.close();
            let _ = transport.shutdown().await;
            shared.forget(key);
        }
    }
}

async fn answer<S>(
    shared: &Shared,
    conn: &mut PeerConnection,
    transport: &mut PeerTransport<S>,
    theirs: &Handshake,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.begin_handshake()?;
    conn.complete_handshake(theirs, shared.peer_id, Instant::now())?;
    let ours = Handshake::new(shared.torrent.info_hash(), shared.peer_id);
    timeout(shared.config.handshake_timeout, transport.send_handshake(&ours))
        .await
        .map_err(|_| PeerError::Timeout)?
}

enum Event {
    Message(Message),
    Command(PeerCommand),
    KeepAlive,
    Stop(&'static str),
}

/// One handshaken connection, driven by its own task.
///
/// The session owns the socket and the [`PeerConnection`] state machine.
/// Swarm-wide bookkeeping is done in short critical sections on the shared
/// state; the lock is never held across an await point.
struct Session<S> {
    shared: Arc<Shared>,
    key: PeerKey,
    conn: PeerConnection,
    transport: PeerTransport<S>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    active: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(
        shared: Arc<Shared>,
        key: PeerKey,
        conn: PeerConnection,
        transport: PeerTransport<S>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Self {
        Self {
            shared,
            key,
            conn,
            transport,
            commands,
            active: false,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    async fn run(mut self) {
        let reason = match self.drive().await {
            Ok(reason) => reason.to_string(),
            Err(e) => {
                if e.is_protocol_violation() {
                    tracing::warn!(peer = %self.addr(), error = %e, "protocol violation");
                } else {
                    tracing::debug!(peer = %self.addr(), error = %e, "connection lost");
                }
                e.to_string()
            }
        };
        self.teardown(reason).await;
    }

    async fn drive(&mut self) -> Result<&'static str, PeerError> {
        let bitfield = self.activate()?;
        if self.shared.is_stopping() {
            return Ok("swarm stopped");
        }
        if let Some(bits) = bitfield {
            self.send(Some(Message::Bitfield(bits))).await?;
        }

        let idle_timeout = self.shared.config.idle_timeout;
        let every = self.shared.config.keepalive_interval;
        let mut keepalive = interval_at(tokio::time::Instant::now() + every, every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shared.shutdown.subscribe();

        loop {
            let idle_at = tokio::time::Instant::from_std(self.conn.last_message_at() + idle_timeout);

            let event = tokio::select! {
                biased;

                _ = super::stopped(&mut shutdown) => Event::Stop("swarm stopped"),
                command = self.commands.recv() => match command {
                    Some(PeerCommand::Close) => Event::Stop("closed by swarm"),
                    Some(command) => Event::Command(command),
                    None => Event::Stop("removed from swarm"),
                },
                message = self.transport.receive_message() => Event::Message(message?),
                _ = keepalive.tick() => Event::KeepAlive,
                _ = sleep_until(idle_at) => return Err(PeerError::Timeout),
            };

            // Nothing more goes on the wire once the swarm is stopping.
            if self.shared.is_stopping() {
                return Ok("swarm stopped");
            }

            match event {
                Event::Message(message) => self.on_message(message).await?,
                Event::Command(command) => self.on_command(command).await?,
                Event::KeepAlive => self.send(Some(Message::KeepAlive)).await?,
                Event::Stop(reason) => return Ok(reason),
            }
        }
    }

    /// Registers the handshake with the swarm and returns our bitfield if
    /// we have anything to announce.
    fn activate(&mut self) -> Result<Option<bytes::Bytes>, PeerError> {
        let peer_id = self.conn.peer_id().ok_or(PeerError::InvalidHandshake)?;
        let bitfield = {
            let mut state = self.shared.state.lock();
            if let Some(displaced) = state.registry.activate(self.key, peer_id)? {
                tracing::debug!(peer = %self.addr(), %displaced, "replacing duplicate connection");
                state.registry.send(displaced, PeerCommand::Close);
            }
            let have = state.tracker.bitfield();
            (!have.is_empty()).then(|| have.to_bytes())
        };

        self.active = true;
        tracing::debug!(peer = %self.addr(), %peer_id, key = %self.key, "peer connected");
        self.shared.emit(SwarmEvent::PeerConnected {
            addr: self.addr(),
            peer_id,
        });
        Ok(bitfield)
    }

    /// Writes a message unless the swarm is stopping.
    async fn send(&mut self, message: Option<Message>) -> Result<(), PeerError> {
        match message {
            Some(_) if self.shared.is_stopping() => Ok(()),
            Some(message) => self.transport.send_message(&message).await,
            None => Ok(()),
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<(), PeerError> {
        match self.conn.on_message(message, Instant::now())? {
            Inbound::Nothing | Inbound::Cancel(_) => Ok(()),
            Inbound::Choked { released } => {
                self.shared
                    .state
                    .lock()
                    .tracker
                    .release_blocks(self.key, &released);
                Ok(())
            }
            Inbound::Unchoked => self.refill().await,
            Inbound::Interested | Inbound::NotInterested => {
                let interested = self.conn.choking().peer_interested;
                if let Some(entry) = self.shared.state.lock().registry.get_mut(self.key) {
                    entry.choking.peer_interested = interested;
                }
                Ok(())
            }
            Inbound::Have(piece) => {
                self.shared.state.lock().tracker.peer_has(piece);
                self.refill().await
            }
            Inbound::Bitfield => {
                self.shared
                    .state
                    .lock()
                    .tracker
                    .peer_bitfield_added(self.conn.bitfield());
                self.refill().await
            }
            Inbound::Request(req) => self.serve(req).await,
            Inbound::Block(block) => self.on_block(block).await,
            Inbound::Extended { id, payload } => {
                let handler = self.shared.extension_handler();
                let reply = handler.on_message(self.shared.torrent.info_hash(), self.addr(), id, payload);
                self.send(reply.map(|(id, payload)| Message::Extended { id, payload }))
                    .await
            }
        }
    }

    async fn on_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::Choke => {
                let message = self.conn.set_choking(true);
                self.send(message).await
            }
            PeerCommand::Unchoke => {
                let message = self.conn.set_choking(false);
                self.send(message).await
            }
            PeerCommand::Have(piece) => {
                self.send(Some(Message::Have { piece })).await?;
                self.refill().await
            }
            PeerCommand::Cancel(req) => {
                // The block may have been requested from us again since.
                if self.shared.state.lock().tracker.owners(&req).contains(&self.key) {
                    return Ok(());
                }
                let message = self.conn.cancel(&req);
                self.send(message).await
            }
            PeerCommand::Refill => self.refill().await,
            PeerCommand::Close => Ok(()),
        }
    }

    /// Updates our interest and tops up the request pipeline.
    async fn refill(&mut self) -> Result<(), PeerError> {
        if self.shared.is_stopping() {
            return Ok(());
        }

        let wants = self.shared.state.lock().tracker.wants_from(self.conn.bitfield());
        let message = self.conn.set_interested(wants);
        self.send(message).await?;

        let slots = self.conn.request_slots();
        if slots == 0 {
            return Ok(());
        }

        let mut messages = Vec::new();
        {
            let mut state = self.shared.state.lock();
            let picked = self
                .shared
                .selector
                .select(&mut state.tracker, self.key, self.conn.bitfield(), slots);
            for req in picked {
                match self.conn.request(req) {
                    Some(message) => messages.push(message),
                    None => state.tracker.release_blocks(self.key, &[req]),
                }
            }
        }

        if !messages.is_empty() {
            tracing::trace!(peer = %self.addr(), count = messages.len(), "requesting blocks");
        }
        for message in &messages {
            self.transport.send_message(message).await?;
        }
        Ok(())
    }

    async fn serve(&mut self, req: BlockRequest) -> Result<(), PeerError> {
        if !self.shared.store.is_available(req.piece) {
            return Err(PeerError::Protocol(format!(
                "request for piece {} we do not have",
                req.piece
            )));
        }

        let data = match self
            .shared
            .store
            .read_block(req.piece, req.offset, req.length)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(peer = %self.addr(), piece = req.piece, error = %e, "failed to read block");
                return Ok(());
            }
        };

        if self.shared.is_stopping() {
            return Ok(());
        }
        let length = data.len() as u64;
        self.transport
            .send_message(&Message::Piece {
                index: req.piece,
                begin: req.offset,
                data,
            })
            .await?;

        let mut state = self.shared.state.lock();
        state.uploaded += length;
        if let Some(entry) = state.registry.get_mut(self.key) {
            entry.stats.record_upload(length);
        }
        Ok(())
    }

    async fn on_block(&mut self, block: Block) -> Result<(), PeerError> {
        let req = block.request();
        let length = block.data.len() as u64;

        let accepted = {
            let mut state = self.shared.state.lock();
            if let Some(entry) = state.registry.get_mut(self.key) {
                entry.stats.record_download(length);
            }
            match state.tracker.accept_block(&req, self.key) {
                Ok(others) => {
                    state.downloaded += length;
                    for other in others {
                        state.registry.send(other, PeerCommand::Cancel(req));
                    }
                    true
                }
                Err(discard) => {
                    tracing::trace!(peer = %self.addr(), piece = req.piece, offset = req.offset, ?discard, "block discarded");
                    false
                }
            }
        };

        if accepted {
            let written = self
                .shared
                .store
                .write_block(req.piece, req.offset, &block.data)
                .await;
            if self.shared.is_stopping() {
                return Ok(());
            }

            match written {
                Ok(()) => {
                    let outcome = self.shared.state.lock().tracker.mark_block_received(&req);
                    if outcome == BlockOutcome::ReadyToVerify {
                        self.verify(req.piece).await;
                    }
                }
                Err(e) => self.shared.storage_failure(req.piece, e.to_string()),
            }
        }

        self.refill().await
    }

    async fn verify(&mut self, piece: u32) {
        let result = self.shared.store.verify_piece(piece).await;
        if self.shared.is_stopping() {
            return;
        }

        let verification = match result {
            Ok(verification) => verification,
            Err(e) => {
                self.shared.storage_failure(piece, e.to_string());
                return;
            }
        };

        let outcome = {
            let mut state = self.shared.state.lock();
            let outcome = state.tracker.finish_verification(piece, verification);
            if let VerifyOutcome::Completed { .. } = outcome {
                state.registry.broadcast(PeerCommand::Have(piece));
            }
            outcome
        };

        match outcome {
            VerifyOutcome::Completed { became_seeding } => {
                tracing::debug!(piece, peer = %self.addr(), "piece verified");
                self.shared.emit(SwarmEvent::PieceCompleted(piece));
                if became_seeding {
                    tracing::info!(info_hash = %self.shared.torrent.info_hash(), "download complete, seeding");
                    self.shared.emit(SwarmEvent::Seeding);
                    self.shared.role.send_replace(Role::Seeding);
                }
            }
            VerifyOutcome::Corrupt => {
                tracing::warn!(piece, peer = %self.addr(), "piece failed hash check");
                self.shared.emit(SwarmEvent::PieceCorrupt(piece));
            }
            VerifyOutcome::Ignored => {}
        }
    }

    async fn teardown(mut self, reason: String) {
        let released = self.conn.close();
        let _ = self.transport.shutdown().await;
        let _ = self.conn.finish_close();

        {
            let mut state = self.shared.state.lock();
            state.tracker.release_blocks(self.key, &released);
            state.tracker.release_peer(self.key);
            if self.active {
                state.tracker.peer_removed(self.conn.bitfield());
            }
        }
        self.shared.forget(self.key);

        if self.active {
            tracing::debug!(peer = %self.addr(), %reason, "peer disconnected");
            self.shared.emit(SwarmEvent::PeerDisconnected {
                addr: self.addr(),
                reason,
            });
        }
    }
}
