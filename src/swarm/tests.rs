use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use super::coordinator::choking_round;
use super::registry::{Admission, PeerCommand, PeerRegistry, Rejection};
use super::*;
use crate::peer::{Message, PeerError};
use crate::storage::{MemoryStorage, StorageError};
use crate::torrent::PieceInfo;

const WAIT: Duration = Duration::from_secs(10);

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn test_config() -> SwarmConfig {
    SwarmConfig::default()
        .with_choke_interval(Duration::from_millis(50))
        .with_request_interval(Duration::from_millis(50))
        .with_keepalive_interval(Duration::from_secs(5))
        .with_idle_timeout(Duration::from_secs(10))
        .with_handshake_timeout(Duration::from_secs(2))
}

fn seeder(data: &[u8], config: SwarmConfig) -> Swarm {
    let torrent = Arc::new(Torrent::from_content("test.bin", data, 32768).unwrap());
    let storage = Arc::new(MemoryStorage::with_content(data.to_vec()));
    Swarm::new(torrent, storage, config, PeerId::generate(), None).unwrap()
}

/// Attaches a fake peer to the swarm as an inbound connection.
async fn attach(swarm: &Swarm, peer_id: PeerId, port: u16) -> PeerTransport<DuplexStream> {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut client = PeerTransport::new(client);
    client
        .send_handshake(&Handshake::new(swarm.info_hash(), peer_id))
        .await
        .unwrap();

    let mut server = PeerTransport::new(server);
    let theirs = server.receive_handshake().await.unwrap();
    swarm.accept(addr(port), server, theirs);
    client
}

async fn next_message(peer: &mut PeerTransport<DuplexStream>) -> Result<Message, PeerError> {
    loop {
        let message = timeout(WAIT, peer.receive_message())
            .await
            .expect("timed out waiting for a message")?;
        if message != Message::KeepAlive {
            return Ok(message);
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_event(events: &mut broadcast::Receiver<SwarmEvent>, mut wanted: impl FnMut(&SwarmEvent) -> bool) {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not seen in time");
}

fn drain(events: &mut broadcast::Receiver<SwarmEvent>) -> Vec<SwarmEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

#[test]
fn test_registry_dedups_and_backs_off() {
    let backoff = Duration::from_secs(60);
    let mut registry = PeerRegistry::new(PeerId([1u8; 20]), 10, backoff);
    let now = Instant::now();

    let key = match registry.candidate(addr(7000), now) {
        Admission::Dial(key, _) => key,
        other => panic!("expected dial, got {:?}", other),
    };
    assert!(matches!(registry.candidate(addr(7000), now), Admission::Ignored));

    registry.remove(key);
    assert!(matches!(
        registry.candidate(addr(7000), now + Duration::from_secs(1)),
        Admission::Ignored
    ));
    assert!(matches!(
        registry.candidate(addr(7000), now + backoff),
        Admission::Dial(..)
    ));
}

#[test]
fn test_registry_queues_beyond_capacity() {
    let mut registry = PeerRegistry::new(PeerId([1u8; 20]), 1, Duration::from_secs(60));
    let now = Instant::now();

    let first = match registry.candidate(addr(7000), now) {
        Admission::Dial(key, _) => key,
        other => panic!("expected dial, got {:?}", other),
    };
    assert!(matches!(registry.candidate(addr(7001), now), Admission::Queued));
    assert!(matches!(registry.candidate(addr(7001), now), Admission::Ignored));
    assert_eq!(registry.pending_count(), 1);
    assert!(registry.next_pending(now).is_none());

    registry.remove(first);
    let (_, next, _) = registry.next_pending(now).unwrap();
    assert_eq!(next, addr(7001));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.pending_count(), 0);
}

#[test]
fn test_registry_inbound_rejections() {
    let mut registry = PeerRegistry::new(PeerId([1u8; 20]), 2, Duration::from_secs(60));

    assert!(registry.admit_inbound(addr(7000)).is_ok());
    assert_eq!(
        registry.admit_inbound(addr(7000)).err(),
        Some(Rejection::DuplicateAddress)
    );
    assert!(registry.admit_inbound(addr(7001)).is_ok());
    assert_eq!(
        registry.admit_inbound(addr(7002)).err(),
        Some(Rejection::AtCapacity)
    );
}

#[test]
fn test_duplicate_peer_id_keeps_lower_initiator() {
    let remote = PeerId([9u8; 20]);

    // We have the lower id: our outbound connection wins over their inbound.
    let mut registry = PeerRegistry::new(PeerId([1u8; 20]), 10, Duration::from_secs(60));
    let (inbound, _rx) = registry.admit_inbound(addr(7000)).unwrap();
    assert_eq!(registry.activate(inbound, remote).unwrap(), None);
    let outbound = match registry.candidate(addr(7001), Instant::now()) {
        Admission::Dial(key, _) => key,
        other => panic!("expected dial, got {:?}", other),
    };
    assert_eq!(registry.activate(outbound, remote).unwrap(), Some(inbound));
    assert_eq!(registry.active_count(), 1);

    // We have the higher id: a late outbound connection loses.
    let mut registry = PeerRegistry::new(PeerId([1u8; 20]), 10, Duration::from_secs(60));
    let remote = PeerId([0u8; 20]);
    let (inbound, _rx) = registry.admit_inbound(addr(7000)).unwrap();
    registry.activate(inbound, remote).unwrap();
    let outbound = match registry.candidate(addr(7001), Instant::now()) {
        Admission::Dial(key, _) => key,
        other => panic!("expected dial, got {:?}", other),
    };
    assert!(matches!(
        registry.activate(outbound, remote),
        Err(PeerError::DuplicateConnection)
    ));
    assert_eq!(registry.active_count(), 1);
}

#[test]
fn test_registry_rejects_own_peer_id() {
    let ours = PeerId([1u8; 20]);
    let mut registry = PeerRegistry::new(ours, 10, Duration::from_secs(60));
    let (key, _rx) = registry.admit_inbound(addr(7000)).unwrap();
    assert!(matches!(
        registry.activate(key, ours),
        Err(PeerError::SelfConnection)
    ));
}

#[test]
fn test_commands_are_not_lost_behind_a_backlog() {
    let mut registry = PeerRegistry::new(PeerId([1u8; 20]), 10, Duration::from_secs(60));
    let (key, mut rx) = registry.admit_inbound(addr(7000)).unwrap();
    registry.activate(key, PeerId([2u8; 20])).unwrap();

    for piece in 0..500 {
        registry.broadcast(PeerCommand::Have(piece));
    }
    assert!(registry.send(key, PeerCommand::Unchoke));

    let mut received = Vec::new();
    while let Ok(command) = rx.try_recv() {
        received.push(command);
    }
    assert_eq!(received.len(), 501);
    assert_eq!(received[499], PeerCommand::Have(499));
    assert_eq!(received.last(), Some(&PeerCommand::Unchoke));

    drop(rx);
    assert!(!registry.send(key, PeerCommand::Choke));
    assert!(!registry.send(PeerKey(99), PeerCommand::Choke));
}

#[test]
fn test_choking_round_mirrors_only_delivered_commands() {
    let swarm = seeder(&content(50_000), test_config());
    let mut policy = ChokingPolicy::new(4, Duration::from_secs(30));

    let (gone, live, mut rx) = {
        let mut state = swarm.shared.state.lock();
        let (gone, gone_rx) = state.registry.admit_inbound(addr(7000)).unwrap();
        let (live, rx) = state.registry.admit_inbound(addr(7001)).unwrap();
        state.registry.activate(gone, PeerId([2u8; 20])).unwrap();
        state.registry.activate(live, PeerId([3u8; 20])).unwrap();
        for key in [gone, live] {
            if let Some(entry) = state.registry.get_mut(key) {
                entry.choking.peer_interested = true;
            }
        }
        drop(gone_rx);
        (gone, live, rx)
    };

    choking_round(&swarm.shared, &mut policy);

    let state = swarm.shared.state.lock();
    assert!(state.registry.get(gone).unwrap().choking.am_choking);
    assert!(!state.registry.get(live).unwrap().choking.am_choking);
    assert_eq!(rx.try_recv().ok(), Some(PeerCommand::Unchoke));
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_start_and_stop_are_guarded() {
    let swarm = seeder(&content(50_000), test_config());
    let mut events = swarm.subscribe();

    swarm.start().await.unwrap();
    assert!(matches!(swarm.start().await, Err(SwarmError::AlreadyStarted)));
    assert_eq!(*swarm.role().borrow(), Role::Seeding);

    swarm.stop().await;
    swarm.stop().await;
    assert!(swarm.is_stopped());
    assert!(matches!(swarm.start().await, Err(SwarmError::Stopped)));

    let stopped = drain(&mut events)
        .into_iter()
        .filter(|event| *event == SwarmEvent::Stopped)
        .count();
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_wait_for_seeding_fails_after_stop() {
    let data = content(50_000);
    let torrent = Arc::new(Torrent::from_content("test.bin", &data, 32768).unwrap());
    let swarm = Swarm::new(
        torrent,
        Arc::new(MemoryStorage::new(data.len() as u64)),
        test_config(),
        PeerId::generate(),
        None,
    )
    .unwrap();
    swarm.start().await.unwrap();

    let waiter = {
        let swarm = swarm.clone();
        tokio::spawn(async move { swarm.wait_for_seeding().await })
    };
    swarm.stop().await;
    assert!(matches!(waiter.await.unwrap(), Err(SwarmError::Stopped)));
}

#[tokio::test]
async fn test_start_loads_existing_data() {
    let swarm = seeder(&content(100_000), test_config());
    swarm.start().await.unwrap();

    let state = swarm.local_state();
    assert_eq!(state.role, Role::Seeding);
    assert_eq!(state.left, 0);
    assert_eq!(state.completion, 1.0);
    assert_eq!(state.peers, 0);
    swarm.stop().await;
}

#[tokio::test]
async fn test_stop_discards_queued_commands() {
    let swarm = seeder(&content(100_000), test_config());
    let mut events = swarm.subscribe();
    swarm.start().await.unwrap();

    let mut peer = attach(&swarm, PeerId::generate(), 7000).await;
    peer.receive_handshake().await.unwrap();
    assert!(matches!(next_message(&mut peer).await.unwrap(), Message::Bitfield(_)));
    wait_for_event(&mut events, |event| matches!(event, SwarmEvent::PeerConnected { .. })).await;

    {
        let state = swarm.shared.state.lock();
        for piece in 0..4 {
            state.registry.broadcast(PeerCommand::Have(piece));
        }
        state.registry.broadcast(PeerCommand::Unchoke);
    }
    swarm.stop().await;

    let after_stop = timeout(WAIT, peer.receive_message())
        .await
        .expect("connection left open after stop");
    assert!(after_stop.is_err(), "sent {:?} after stop", after_stop);
}

// ----------------------------------------------------------------------------
// Serving
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_seeder_unchokes_interested_peer_and_serves() {
    let data = content(100_000);
    let swarm = seeder(&data, test_config());
    swarm.start().await.unwrap();

    let mut peer = attach(&swarm, PeerId::generate(), 7000).await;
    let ours = peer.receive_handshake().await.unwrap();
    assert_eq!(ours.peer_id, swarm.peer_id());
    assert_eq!(
        next_message(&mut peer).await.unwrap(),
        Message::Bitfield(Bytes::from_static(&[0xF0]))
    );

    peer.send_message(&Message::Interested).await.unwrap();
    assert_eq!(next_message(&mut peer).await.unwrap(), Message::Unchoke);

    peer.send_message(&Message::Request {
        index: 1,
        begin: 16384,
        length: 16384,
    })
    .await
    .unwrap();
    assert_eq!(
        next_message(&mut peer).await.unwrap(),
        Message::Piece {
            index: 1,
            begin: 16384,
            data: Bytes::copy_from_slice(&data[32768 + 16384..65536]),
        }
    );

    eventually(|| swarm.local_state().uploaded == 16384).await;
    assert_eq!(swarm.local_state().peers, 1);
    swarm.stop().await;
}

#[tokio::test]
async fn test_requests_while_choked_are_dropped_then_punished() {
    let data = content(100_000);
    let swarm = seeder(&data, test_config().with_pipeline_depth(2));
    swarm.start().await.unwrap();
    let mut events = swarm.subscribe();

    let mut peer = attach(&swarm, PeerId::generate(), 7000).await;
    peer.receive_handshake().await.unwrap();
    assert!(matches!(next_message(&mut peer).await, Ok(Message::Bitfield(_))));

    // Never interested, so never unchoked.
    let request = Message::Request {
        index: 0,
        begin: 0,
        length: 16384,
    };
    peer.send_message(&request).await.unwrap();
    assert!(timeout(Duration::from_millis(200), peer.receive_message())
        .await
        .is_err());

    peer.send_message(&request).await.unwrap();
    peer.send_message(&request).await.unwrap();
    assert!(next_message(&mut peer).await.is_err());

    wait_for_event(&mut events, |event| {
        matches!(event, SwarmEvent::PeerDisconnected { addr, .. } if *addr == self::addr(7000))
    })
    .await;
    assert_eq!(swarm.local_state().peers, 0);
    assert_eq!(swarm.local_state().uploaded, 0);
    swarm.stop().await;
}

#[tokio::test]
async fn test_idle_peer_is_disconnected() {
    let config = test_config()
        .with_keepalive_interval(Duration::from_millis(100))
        .with_idle_timeout(Duration::from_millis(300));
    let swarm = seeder(&content(50_000), config);
    swarm.start().await.unwrap();

    let mut peer = attach(&swarm, PeerId::generate(), 7000).await;
    peer.receive_handshake().await.unwrap();

    let started = Instant::now();
    let closed = timeout(WAIT, async {
        loop {
            if peer.receive_message().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(250));
    swarm.stop().await;
}

#[tokio::test]
async fn test_bad_handshakes_are_refused() {
    let swarm = seeder(&content(50_000), test_config());
    swarm.start().await.unwrap();

    // Our own peer-id.
    let mut own = attach(&swarm, swarm.peer_id(), 7000).await;
    assert!(own.receive_handshake().await.is_err());

    // A different torrent.
    let (client, server) = tokio::io::duplex(4096);
    let mut client = PeerTransport::new(client);
    client
        .send_handshake(&Handshake::new(InfoHash::from([7u8; 20]), PeerId::generate()))
        .await
        .unwrap();
    let mut server = PeerTransport::new(server);
    let theirs = server.receive_handshake().await.unwrap();
    swarm.accept(addr(7001), server, theirs);
    assert!(client.receive_handshake().await.is_err());

    eventually(|| swarm.shared.state.lock().registry.len() == 0).await;
    swarm.stop().await;
}

#[tokio::test]
async fn test_duplicate_connections_are_refused() {
    let swarm = seeder(&content(50_000), test_config());
    swarm.start().await.unwrap();

    let mut first = attach(&swarm, PeerId::generate(), 7000).await;
    first.receive_handshake().await.unwrap();

    // Same address.
    let mut same_addr = attach(&swarm, PeerId::generate(), 7000).await;
    assert!(same_addr.receive_handshake().await.is_err());

    // Same peer-id from another address: the first connection is kept.
    let peer_id = PeerId::generate();
    let mut a = attach(&swarm, peer_id, 7001).await;
    a.receive_handshake().await.unwrap();
    assert!(matches!(next_message(&mut a).await, Ok(Message::Bitfield(_))));
    let mut b = attach(&swarm, peer_id, 7002).await;
    b.receive_handshake().await.unwrap();
    assert!(next_message(&mut b).await.is_err());

    eventually(|| swarm.local_state().peers == 2).await;
    swarm.stop().await;
    assert!(next_message(&mut first).await.is_ok_and(|m| matches!(m, Message::Bitfield(_))));
    assert!(next_message(&mut first).await.is_err());
}

struct Echo;

impl ExtensionHandler for Echo {
    fn on_message(&self, _: InfoHash, _: SocketAddr, id: u8, payload: Bytes) -> Option<(u8, Bytes)> {
        Some((id, payload))
    }
}

#[tokio::test]
async fn test_extended_messages_reach_the_handler() {
    let swarm = seeder(&content(50_000), test_config());
    swarm.set_extension_handler(Arc::new(Echo));
    swarm.start().await.unwrap();

    let mut peer = attach(&swarm, PeerId::generate(), 7000).await;
    peer.receive_handshake().await.unwrap();
    assert!(matches!(next_message(&mut peer).await, Ok(Message::Bitfield(_))));

    let extended = Message::Extended {
        id: 3,
        payload: Bytes::from_static(b"d1:pi1ee"),
    };
    peer.send_message(&extended).await.unwrap();
    assert_eq!(next_message(&mut peer).await.unwrap(), extended);
    swarm.stop().await;
}

// ----------------------------------------------------------------------------
// Downloading
// ----------------------------------------------------------------------------

/// Serves every request from `data`, corrupting the first copy of each
/// block of `corrupt_piece`.
async fn fake_seeder(mut peer: PeerTransport<DuplexStream>, data: Vec<u8>, piece_length: usize, corrupt_piece: u32) {
    peer.send_message(&Message::Bitfield(Bytes::from_static(&[0xF0])))
        .await
        .unwrap();
    peer.send_message(&Message::Unchoke).await.unwrap();

    let mut corrupted = HashSet::new();
    while let Ok(message) = peer.receive_message().await {
        let Message::Request {
            index,
            begin,
            length,
        } = message
        else {
            continue;
        };
        let start = index as usize * piece_length + begin as usize;
        let mut block = data[start..start + length as usize].to_vec();
        if index == corrupt_piece && corrupted.insert(begin) {
            block.iter_mut().for_each(|byte| *byte = byte.wrapping_add(1));
        }
        let reply = Message::Piece {
            index,
            begin,
            data: Bytes::from(block),
        };
        if peer.send_message(&reply).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_leecher_recovers_from_corrupt_piece() {
    let data = content(100_000);
    let torrent = Arc::new(Torrent::from_content("test.bin", &data, 32768).unwrap());
    let storage = Arc::new(MemoryStorage::new(data.len() as u64));
    let swarm = Swarm::new(torrent, storage.clone(), test_config(), PeerId::generate(), None).unwrap();
    let mut events = swarm.subscribe();
    swarm.start().await.unwrap();
    assert_eq!(*swarm.role().borrow(), Role::Leeching);

    let mut peer = attach(&swarm, PeerId::generate(), 7000).await;
    peer.receive_handshake().await.unwrap();
    let server = tokio::spawn(fake_seeder(peer, data.clone(), 32768, 0));

    timeout(WAIT, swarm.wait_for_seeding())
        .await
        .expect("download did not finish")
        .unwrap();

    assert_eq!(storage.snapshot().as_ref(), data.as_slice());
    let state = swarm.local_state();
    assert_eq!(state.role, Role::Seeding);
    assert_eq!(state.left, 0);
    assert!(state.downloaded >= data.len() as u64);

    let seen = drain(&mut events);
    assert!(seen.contains(&SwarmEvent::PieceCorrupt(0)));
    assert!(seen.contains(&SwarmEvent::Seeding));
    let completed: HashSet<u32> = seen
        .iter()
        .filter_map(|event| match event {
            SwarmEvent::PieceCompleted(piece) => Some(*piece),
            _ => None,
        })
        .collect();
    assert_eq!(completed, (0..4).collect());

    swarm.stop().await;
    server.await.unwrap();
}

/// Memory storage whose first write into `failing_piece` fails.
struct FlakyStorage {
    inner: MemoryStorage,
    failing_piece: u32,
    failed: AtomicBool,
}

#[async_trait]
impl PieceStorage for FlakyStorage {
    async fn read(&self, piece: &PieceInfo, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        self.inner.read(piece, offset, length).await
    }

    async fn write(&self, piece: &PieceInfo, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        if piece.index == self.failing_piece && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.write(piece, offset, data).await
    }
}

#[tokio::test]
async fn test_leecher_recovers_from_storage_failure() {
    let data = content(100_000);
    let torrent = Arc::new(Torrent::from_content("test.bin", &data, 32768).unwrap());
    let storage = Arc::new(FlakyStorage {
        inner: MemoryStorage::new(data.len() as u64),
        failing_piece: 1,
        failed: AtomicBool::new(false),
    });
    let swarm = Swarm::new(torrent, storage.clone(), test_config(), PeerId::generate(), None).unwrap();
    let mut events = swarm.subscribe();
    swarm.start().await.unwrap();

    let mut peer = attach(&swarm, PeerId::generate(), 7000).await;
    peer.receive_handshake().await.unwrap();
    let server = tokio::spawn(fake_seeder(peer, data.clone(), 32768, u32::MAX));

    timeout(WAIT, swarm.wait_for_seeding())
        .await
        .expect("download did not finish")
        .unwrap();

    assert!(storage.failed.load(Ordering::SeqCst));
    assert_eq!(storage.inner.snapshot().as_ref(), data.as_slice());
    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|event| matches!(event, SwarmEvent::StorageFailure { piece: 1, .. })));
    assert!(seen.contains(&SwarmEvent::PieceCompleted(1)));

    swarm.stop().await;
    server.await.unwrap();
}
