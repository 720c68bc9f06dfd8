// Integration tests for the decentralis vault core.
// These validate end-to-end chunking, distribution, reconstruction and
// replication against real RPC servers on loopback sockets.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use decentralis::clock::test_clock::ManualClock;
use decentralis::clock::{Clock, SystemClock};
use decentralis::config::Config;
use decentralis::cryptography::CipherAlgorithm;
use decentralis::db::ChunkDb;
use decentralis::error::Error;
use decentralis::keystore;
use decentralis::manager::ChunkingManager;
use decentralis::models::{ChunkRole, PeerAddr, PeerSet};
use decentralis::replication::ReplicationManager;
use decentralis::rpc::PeerClient;
use decentralis::server::RpcServer;
use decentralis::store::ChunkStore;

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "decentralis_it_{}_{}_{}",
        label,
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

fn write_sample_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// A remote peer: its own store, db and RPC server on a loopback port.
struct RemotePeer {
    addr: PeerAddr,
    cancel: CancellationToken,
}

impl RemotePeer {
    /// Stop serving; later connections are refused.
    async fn kill(&self) {
        self.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn spawn_peer(name: &str) -> RemotePeer {
    let db = Arc::new(ChunkDb::open_in_memory().unwrap());
    let store = Arc::new(ChunkStore::new(scratch_dir(name)).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let server = RpcServer::new(
        name.to_string(),
        store,
        db,
        Arc::new(SystemClock),
        cancel.clone(),
    );
    tokio::spawn(server.serve(listener));
    RemotePeer {
        addr: PeerAddr {
            uuid: name.to_string(),
            ip: "127.0.0.1".to_string(),
            port,
        },
        cancel,
    }
}

async fn spawn_peers(label: &str, count: usize) -> Vec<RemotePeer> {
    let mut peers = Vec::new();
    for i in 0..count {
        peers.push(spawn_peer(&format!("{label}-peer{i}")).await);
    }
    peers
}

/// The owner node under test, wired with a manual clock and a hand-fed
/// peer snapshot channel in place of a live tracker.
struct OwnerNode {
    config: Config,
    db: Arc<ChunkDb>,
    store: Arc<ChunkStore>,
    clock: Arc<ManualClock>,
    manager: Arc<ChunkingManager>,
    replication: Arc<ReplicationManager>,
    _peers_tx: watch::Sender<Arc<PeerSet>>,
}

fn build_owner(label: &str, peers: Vec<PeerAddr>) -> OwnerNode {
    let config = Config {
        data_dir: scratch_dir(label),
        retry_delay: Duration::from_millis(10),
        rpc_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    let db = Arc::new(ChunkDb::open_in_memory().unwrap());
    let store = Arc::new(ChunkStore::new(config.chunks_dir()).unwrap());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cancel = CancellationToken::new();
    let (peers_tx, peers_rx) = watch::channel(Arc::new(PeerSet {
        peers,
        fetched_at: Some(clock.now()),
    }));
    let rpc = Arc::new(PeerClient::new(
        Arc::clone(&db),
        clock.clone() as Arc<dyn Clock>,
        config.rpc_timeout,
    ));
    let manager = ChunkingManager::new(
        config.clone(),
        "owner".to_string(),
        Arc::clone(&db),
        Arc::clone(&store),
        Arc::clone(&rpc),
        peers_rx,
        clock.clone() as Arc<dyn Clock>,
        cancel,
    );
    let replication = ReplicationManager::new(
        config.clone(),
        "owner".to_string(),
        Arc::clone(&db),
        Arc::clone(&store),
        rpc,
        clock.clone() as Arc<dyn Clock>,
    );
    OwnerNode {
        config,
        db,
        store,
        clock,
        manager,
        replication,
        _peers_tx: peers_tx,
    }
}

// ============================================================================
// Happy path: chunk, distribute, lose peers, reconstruct
// ============================================================================

#[tokio::test]
async fn distribute_and_reconstruct_after_losing_two_peers() {
    let peers = spawn_peers("happy", 5).await;
    let owner = build_owner("happy_owner", peers.iter().map(|p| p.addr.clone()).collect());

    // K=6, M=4, group size 2 -> 13 chunks.
    let data = sample_data(60_000);
    let path = write_sample_file(&owner.config.data_dir, "archive.bin", &data);
    let file_uuid = owner.manager.chunk_file(&path, "owner").await.unwrap();

    let report = owner.manager.distribute_chunks(&file_uuid, "owner").await.unwrap();
    assert_eq!(report.total_chunks, 13);
    assert_eq!(report.distributed, 13);
    assert_eq!(report.failed, 0);
    assert!(!report.no_peers);
    // The owner keeps no redundant copies once peers confirmed.
    assert!(owner.store.list_chunks("owner", &file_uuid).unwrap().is_empty());

    // Kill two of five peers. At most four code chunks disappear, which
    // RS(6,4) tolerates.
    peers[3].kill().await;
    peers[4].kill().await;

    let restored = owner
        .manager
        .reconstruct_file(&file_uuid, "owner", None)
        .await
        .unwrap();
    assert_eq!(restored, data);
}

// ============================================================================
// LRC shortcut: a single local loss repairs without any parity
// ============================================================================

#[tokio::test]
async fn lrc_repairs_single_loss_with_no_peers_at_all() {
    // No peers exist, so anything beyond local chunks + LRC would fail.
    let owner = build_owner("lrc_owner", Vec::new());

    let data = sample_data(24_000);
    let path = write_sample_file(&owner.config.data_dir, "notes.bin", &data);
    let file_uuid = owner.manager.chunk_file(&path, "owner").await.unwrap();

    // Lose data chunk 1 locally. Group {0, 1} plus its XOR symbol must be
    // enough; no RS parity fetch is possible here.
    owner.store.delete_chunk("owner", &file_uuid, 1).unwrap();
    owner.db.delete_chunk_row("owner", &file_uuid, 1).unwrap();

    let restored = owner
        .manager
        .reconstruct_file(&file_uuid, "owner", None)
        .await
        .unwrap();
    assert_eq!(restored, data);
}

// ============================================================================
// Degraded: losses beyond the code's tolerance
// ============================================================================

#[tokio::test]
async fn too_many_lost_peers_leaves_file_degraded_without_partial_output() {
    let peers = spawn_peers("degraded", 2).await;
    let owner = build_owner("degraded_owner", peers.iter().map(|p| p.addr.clone()).collect());

    let data = sample_data(30_000);
    let path = write_sample_file(&owner.config.data_dir, "doomed.bin", &data);
    let file_uuid = owner.manager.chunk_file(&path, "owner").await.unwrap();
    let report = owner.manager.distribute_chunks(&file_uuid, "owner").await.unwrap();
    assert_eq!(report.distributed, 13);

    // Both holders vanish and stay silent past the loss window.
    peers[0].kill().await;
    peers[1].kill().await;
    owner.clock.advance(chrono::Duration::seconds(60));

    let output = owner.config.data_dir.join("should_not_exist.bin");
    let err = owner
        .manager
        .reconstruct_file(&file_uuid, "owner", Some(&output))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientChunks { .. }));
    // No partial file may be written.
    assert!(!output.exists());

    let status = owner.manager.get_file_status(&file_uuid).unwrap();
    assert!(!status.reconstructable);
    assert_eq!(status.available_local, 0);
    assert!(status.degraded);
}

// ============================================================================
// Container auto-sync and restore-on-start
// ============================================================================

#[tokio::test]
async fn container_sync_then_restore_from_network() {
    let peers = spawn_peers("container", 3).await;
    let owner = build_owner("container_owner", peers.iter().map(|p| p.addr.clone()).collect());

    // The file browser writes the encrypted container; any bytes do here.
    let container_bytes = sample_data(8_192);
    let container_path = owner.config.container_path();
    std::fs::create_dir_all(container_path.parent().unwrap()).unwrap();
    std::fs::write(&container_path, &container_bytes).unwrap();

    let file_uuid = owner.manager.sync_container().await.unwrap().expect("first sync chunks");
    // Unchanged bytes are a no-op.
    assert!(owner.manager.sync_container().await.unwrap().is_none());
    // Local copies were dropped after confirmed distribution.
    assert!(owner.store.list_chunks("owner", &file_uuid).unwrap().is_empty());

    // Simulate losing the local container entirely.
    std::fs::remove_file(&container_path).unwrap();
    let restored_to = owner
        .manager
        .restore_container_on_start()
        .await
        .unwrap()
        .expect("container should be recovered");
    assert_eq!(restored_to, container_path);
    assert_eq!(std::fs::read(&container_path).unwrap(), container_bytes);
}

// ============================================================================
// Peer loss triggers relocation
// ============================================================================

#[tokio::test]
async fn lost_peer_chunks_are_relocated_and_file_survives() {
    let peers = spawn_peers("relocate", 4).await;
    // Distribute over the first three peers only.
    let owner = build_owner(
        "relocate_owner",
        peers[..3].iter().map(|p| p.addr.clone()).collect(),
    );

    let data = sample_data(42_000);
    let path = write_sample_file(&owner.config.data_dir, "vaulted.bin", &data);
    let file_uuid = owner.manager.chunk_file(&path, "owner").await.unwrap();
    let report = owner.manager.distribute_chunks(&file_uuid, "owner").await.unwrap();
    assert_eq!(report.distributed, 13);

    // Make the spare peer known so it can serve as a replacement target.
    owner.db.upsert_peer(&peers[3].addr, owner.clock.now()).unwrap();

    // One holder goes away.
    let lost_uuid = peers[1].addr.uuid.clone();
    let lost_indices: Vec<usize> = owner
        .db
        .get_locations_by_peer(&lost_uuid)
        .unwrap()
        .into_iter()
        .map(|l| l.index)
        .collect();
    assert!(!lost_indices.is_empty());
    peers[1].kill().await;

    let queued = owner.replication.on_peer_disconnected(&lost_uuid).unwrap();
    assert_eq!(queued, lost_indices.len());

    let completed = owner.replication.process_pending_relocations().await.unwrap();
    assert_eq!(completed, lost_indices.len());

    // Every lost chunk now has a confirmed location on some other peer,
    // and the history records the successful moves.
    for index in &lost_indices {
        let locations = owner.db.get_locations(&file_uuid, *index).unwrap();
        assert!(locations
            .iter()
            .any(|l| l.confirmed && l.peer_uuid != lost_uuid));
        assert!(!locations.iter().any(|l| l.peer_uuid == lost_uuid));
    }
    let history = owner.db.replication_history_for(&file_uuid).unwrap();
    let successes = history.iter().filter(|(_, _, ok)| *ok).count();
    assert_eq!(successes, lost_indices.len());

    // Reconstruction succeeds without the lost peer.
    let restored = owner
        .manager
        .reconstruct_file(&file_uuid, "owner", None)
        .await
        .unwrap();
    assert_eq!(restored, data);
}

// ============================================================================
// RPC method surface
// ============================================================================

#[tokio::test]
async fn rpc_methods_against_a_live_server() {
    let peer = spawn_peer("rpc-target").await;
    let db = Arc::new(ChunkDb::open_in_memory().unwrap());
    let client = PeerClient::new(
        Arc::clone(&db),
        Arc::new(SystemClock),
        Duration::from_secs(5),
    );

    assert_eq!(client.ping(&peer.addr).await.unwrap(), "rpc-target");

    let data = sample_data(1024);
    let sha = decentralis::models::sha256_hex(&data);
    client
        .store_chunk(&peer.addr, "owner", "file-1", 0, ChunkRole::Data, &sha, &data)
        .await
        .unwrap();
    // Storing the identical chunk again is a no-op, which keeps retries
    // idempotent.
    client
        .store_chunk(&peer.addr, "owner", "file-1", 0, ChunkRole::Data, &sha, &data)
        .await
        .unwrap();

    // A declared hash that does not match the payload is rejected.
    let err = client
        .store_chunk(&peer.addr, "owner", "file-1", 1, ChunkRole::Data, "bogus", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerCommunication { .. }));

    let (fetched, fetched_sha) = client.get_chunk(&peer.addr, "owner", "file-1", 0).await.unwrap();
    assert_eq!(fetched, data);
    assert_eq!(fetched_sha, sha);

    let info = client.get_chunk_info(&peer.addr, "owner", "file-1", 0).await.unwrap();
    assert_eq!(info.size, 1024);
    assert_eq!(info.sha256, sha);

    assert_eq!(
        client.list_chunks(&peer.addr, "owner", "file-1").await.unwrap(),
        vec![0]
    );

    client.delete_chunk(&peer.addr, "owner", "file-1", 0).await.unwrap();
    // Idempotent delete.
    client.delete_chunk(&peer.addr, "owner", "file-1", 0).await.unwrap();
    let err = client.get_chunk(&peer.addr, "owner", "file-1", 0).await.unwrap_err();
    assert!(matches!(err, Error::ChunkNotFound { index: 0, .. }));

    // Unknown methods report the JSON-RPC method-not-found code.
    let err = client
        .call(&peer.addr, "no_such_method", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("-32601"));
}

#[tokio::test]
async fn announce_and_search_file_metadata() {
    let peer = spawn_peer("announce-target").await;
    let owner = build_owner("announce_owner", vec![peer.addr.clone()]);

    let data = sample_data(9_000);
    let path = write_sample_file(&owner.config.data_dir, "shared.bin", &data);
    let file_uuid = owner.manager.chunk_file(&path, "owner").await.unwrap();
    let metadata = owner.db.get_file_metadata(&file_uuid).unwrap().unwrap();

    let client = PeerClient::new(
        Arc::clone(&owner.db),
        Arc::new(SystemClock),
        Duration::from_secs(5),
    );
    client.announce_file(&peer.addr, &metadata).await.unwrap();

    let found = client
        .search_file(&peer.addr, "owner", "shared.bin")
        .await
        .unwrap()
        .expect("announced file should be searchable");
    assert_eq!(found.file_uuid, file_uuid);
    assert_eq!(found.metadata.original_size, data.len() as u64);

    assert!(client
        .search_file(&peer.addr, "owner", "unknown.bin")
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Keystore end to end
// ============================================================================

#[test]
fn retention_file_gates_on_the_right_passphrase() {
    let dir = scratch_dir("keystore");
    let path = dir.join("key.json");
    keystore::generate_retention(&path, "alpha", 100_000, CipherAlgorithm::Aes256Gcm).unwrap();

    let err = keystore::verify_passphrase(&path, "beta").unwrap_err();
    assert!(matches!(err, Error::WrongPassphrase));

    let key_hex = keystore::verify_passphrase(&path, "alpha").unwrap();
    assert_eq!(key_hex.len(), 64);
    assert!(key_hex.chars().all(|c| c.is_ascii_hexdigit()));
}

// ============================================================================
// Expiry sweep
// ============================================================================

#[tokio::test]
async fn expired_files_are_swept_locally_and_remotely() {
    let peers = spawn_peers("expiry", 2).await;
    let owner = build_owner("expiry_owner", peers.iter().map(|p| p.addr.clone()).collect());

    let data = sample_data(12_000);
    let path = write_sample_file(&owner.config.data_dir, "ephemeral.bin", &data);
    let file_uuid = owner.manager.chunk_file(&path, "owner").await.unwrap();
    owner.manager.distribute_chunks(&file_uuid, "owner").await.unwrap();

    // Jump past the 30-day retention window.
    owner.clock.advance(chrono::Duration::days(31));
    let removed = owner.manager.cleanup_expired_files().await.unwrap();
    assert_eq!(removed, 1);

    // No metadata, chunks or locations survive.
    assert!(owner.db.get_file_metadata(&file_uuid).unwrap().is_none());
    assert!(owner.db.get_chunks_by_file(&file_uuid).unwrap().is_empty());
    assert!(owner.db.get_locations_by_file(&file_uuid).unwrap().is_empty());
    assert!(owner.store.list_chunks("owner", &file_uuid).unwrap().is_empty());
}
