use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use super::*;
use crate::config::{ConfigError, EncryptionPolicy};
use crate::discovery::LocalDirectory;
use crate::peer::Handshake;
use crate::storage::MemoryStorage;
use crate::swarm::{Role, SwarmEvent};

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(60);

/// Logs to the test writer when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed as usize) % 253) as u8)
        .collect()
}

fn fast_swarm_config() -> SwarmConfig {
    SwarmConfig::default()
        .with_choke_interval(Duration::from_millis(100))
        .with_optimistic_unchoke_interval(Duration::from_millis(300))
        .with_request_interval(Duration::from_millis(50))
        .with_announce_interval(Duration::from_secs(1))
        .with_reconnect_backoff(Duration::from_millis(500))
        .with_keepalive_interval(Duration::from_secs(1))
        .with_idle_timeout(Duration::from_secs(10))
        .with_handshake_timeout(Duration::from_secs(2))
}

fn loopback_config() -> EngineConfig {
    EngineConfig::default()
        .with_listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_swarm(fast_swarm_config())
}

struct Node {
    engine: Engine,
    swarm: Swarm,
    storage: Arc<MemoryStorage>,
}

async fn join(directory: &LocalDirectory, torrent: &Arc<Torrent>, data: Option<&[u8]>) -> Node {
    let engine = Engine::bind(loopback_config()).await.unwrap();
    let storage = Arc::new(match data {
        Some(data) => MemoryStorage::with_content(data.to_vec()),
        None => MemoryStorage::new(torrent.total_length()),
    });
    let swarm = engine
        .add_torrent(torrent.clone(), storage.clone())
        .await
        .unwrap();
    swarm.add_discovery(directory.client(engine.candidate_sink()));
    Node {
        engine,
        swarm,
        storage,
    }
}

/// Runs `seeders` complete nodes and `leechers` empty ones until every
/// leecher seeds, then checks their content.
async fn run_swarm(seeders: usize, leechers: usize) {
    init_tracing();
    let data = content(300_000, (seeders * 10 + leechers) as u8);
    let torrent = Arc::new(Torrent::from_content("scenario.bin", &data, 32768).unwrap());
    let directory = LocalDirectory::new();

    let mut nodes = Vec::new();
    for _ in 0..seeders {
        nodes.push(join(&directory, &torrent, Some(&data)).await);
    }
    for _ in 0..leechers {
        nodes.push(join(&directory, &torrent, None).await);
    }

    for node in &nodes[..seeders] {
        assert_eq!(*node.swarm.role().borrow(), Role::Seeding);
    }

    let waits = nodes[seeders..].iter().map(|node| node.swarm.wait_for_seeding());
    timeout(SCENARIO_TIMEOUT, futures::future::try_join_all(waits))
        .await
        .expect("swarm did not converge")
        .unwrap();

    for node in &nodes {
        let state = node.swarm.local_state();
        assert_eq!(state.role, Role::Seeding);
        assert_eq!(state.left, 0);
        assert_eq!(node.storage.snapshot().as_ref(), data.as_slice());
        assert!(node.swarm.store().is_available(0));
    }

    for node in &nodes {
        node.engine.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_seeder_one_leecher() {
    run_swarm(1, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_seeders_five_leechers() {
    run_swarm(5, 5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_seeder_five_leechers() {
    run_swarm(1, 5).await;
}

#[tokio::test]
async fn test_engine_hosts_several_torrents() {
    let engine = Engine::bind(loopback_config()).await.unwrap();
    let a = Arc::new(Torrent::from_content("a.bin", &content(40_000, 1), 16384).unwrap());
    let b = Arc::new(Torrent::from_content("b.bin", &content(40_000, 2), 16384).unwrap());

    engine
        .add_torrent(a.clone(), Arc::new(MemoryStorage::new(a.total_length())))
        .await
        .unwrap();
    engine
        .add_torrent(b.clone(), Arc::new(MemoryStorage::new(b.total_length())))
        .await
        .unwrap();

    let duplicate = engine
        .add_torrent(a.clone(), Arc::new(MemoryStorage::new(a.total_length())))
        .await;
    assert!(matches!(duplicate, Err(SwarmError::DuplicateTorrent(hash)) if hash == a.info_hash()));

    let mut hosted = engine.torrents();
    hosted.sort();
    let mut expected = vec![a.info_hash(), b.info_hash()];
    expected.sort();
    assert_eq!(hosted, expected);

    engine.remove_torrent(&a.info_hash()).await.unwrap();
    assert!(engine.swarm(&a.info_hash()).is_none());
    assert!(matches!(
        engine.remove_torrent(&a.info_hash()).await,
        Err(SwarmError::UnknownTorrent(_))
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_inbound_connections_are_routed_by_info_hash() {
    let data = content(40_000, 3);
    let torrent = Arc::new(Torrent::from_content("routed.bin", &data, 16384).unwrap());
    let engine = Engine::bind(loopback_config()).await.unwrap();
    let swarm = engine
        .add_torrent(torrent.clone(), Arc::new(MemoryStorage::with_content(data)))
        .await
        .unwrap();
    let mut events = swarm.subscribe();

    // Unknown torrent: the engine hangs up without answering.
    let mut stray = TcpStream::connect(engine.local_addr()).await.unwrap();
    stray
        .write_all(&Handshake::new(InfoHash::from([9u8; 20]), PeerId::generate()).encode())
        .await
        .unwrap();
    let mut buf = [0u8; 68];
    let read = timeout(Duration::from_secs(5), stray.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);

    // Known torrent: the swarm answers with its handshake.
    let mut transport = PeerTransport::connect(engine.local_addr(), Duration::from_secs(2))
        .await
        .unwrap();
    let peer_id = PeerId::generate();
    transport
        .send_handshake(&Handshake::new(torrent.info_hash(), peer_id))
        .await
        .unwrap();
    let answer = transport.receive_handshake().await.unwrap();
    assert_eq!(answer.peer_id, engine.peer_id());
    assert_eq!(answer.info_hash, torrent.info_hash());

    let connected = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(connected, SwarmEvent::PeerConnected { peer_id: id, .. } if id == peer_id));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_candidates_reach_the_matching_swarm() {
    let data = content(40_000, 4);
    let torrent = Arc::new(Torrent::from_content("dial.bin", &data, 16384).unwrap());
    let seeder = Engine::bind(loopback_config()).await.unwrap();
    let leecher = Engine::bind(loopback_config()).await.unwrap();

    seeder
        .add_torrent(torrent.clone(), Arc::new(MemoryStorage::with_content(data)))
        .await
        .unwrap();
    let swarm = leecher
        .add_torrent(torrent.clone(), Arc::new(MemoryStorage::new(torrent.total_length())))
        .await
        .unwrap();

    // Unknown info-hash is ignored, the right one is dialed.
    leecher.candidate_peer(InfoHash::from([1u8; 20]), seeder.local_addr());
    leecher.candidate_peer(torrent.info_hash(), seeder.local_addr());

    timeout(SCENARIO_TIMEOUT, swarm.wait_for_seeding())
        .await
        .expect("download did not finish")
        .unwrap();

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let engine = Engine::bind(loopback_config()).await.unwrap();
    let torrent = Arc::new(Torrent::from_content("stop.bin", &content(20_000, 5), 16384).unwrap());
    let swarm = engine
        .add_torrent(torrent.clone(), Arc::new(MemoryStorage::new(torrent.total_length())))
        .await
        .unwrap();

    engine.shutdown().await;
    engine.shutdown().await;
    assert!(swarm.is_stopped());
    assert!(engine.torrents().is_empty());
    assert!(matches!(
        engine
            .add_torrent(torrent.clone(), Arc::new(MemoryStorage::new(torrent.total_length())))
            .await,
        Err(SwarmError::Stopped)
    ));
}

#[tokio::test]
async fn test_required_encryption_is_rejected() {
    let config = loopback_config().with_encryption_policy(EncryptionPolicy::RequireEncrypted);
    assert!(matches!(
        Engine::bind(config).await,
        Err(SwarmError::Config(ConfigError::EncryptionUnavailable))
    ));
}
