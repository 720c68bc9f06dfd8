//! # Commands Module
//!
//! Command handlers behind the `decentralis` binary:
//!
//! ## `run`
//! Starts the vault core: announces to the tracker, serves chunk RPCs,
//! restores the container if it is missing locally, and runs the
//! replication, expiry and container-sync sweeps until interrupted.
//!
//! ## `chunk`
//! Chunks a file with Reed-Solomon + LRC and distributes the chunks to
//! the current peer set.
//!
//! ## `reconstruct`
//! Rebuilds a file from local and remote chunks and writes it out.
//!
//! ## `status`
//! Prints node statistics, the file list, or one file's availability.
//!
//! ## `init-key`
//! Creates the retention record from a passphrase.

pub mod chunk;
pub mod init_key;
pub mod reconstruct;
pub mod run;
pub mod status;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::ChunkDb;
use crate::error::{Error, Result};
use crate::manager::ChunkingManager;
use crate::models::PeerSet;
use crate::replication::ReplicationManager;
use crate::rpc::PeerClient;
use crate::store::ChunkStore;
use crate::tracker::TrackerClient;

/// Everything a command needs: the wired-up core plus the handles to shut
/// it down again.
pub(crate) struct Core {
    pub config: Config,
    pub peer_uuid: String,
    pub db: Arc<ChunkDb>,
    pub store: Arc<ChunkStore>,
    pub clock: Arc<dyn Clock>,
    pub manager: Arc<ChunkingManager>,
    pub replication: Arc<ReplicationManager>,
    pub cancel: CancellationToken,
    pub handles: Vec<JoinHandle<()>>,
    pub peers_rx: watch::Receiver<Arc<PeerSet>>,
}

/// Open the database and store, announce to the tracker, and wire the
/// managers together. Commands add their own background tasks on top.
pub(crate) async fn open_core(config: Config) -> Result<Core> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(ChunkDb::open(&config.db_path())?);
    let store = Arc::new(ChunkStore::new(config.chunks_dir())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cancel = CancellationToken::new();

    let tracker = Arc::new(TrackerClient::new(
        config.tracker_addr.clone(),
        config.announce_ip.clone(),
        config.listen_port,
        config.keepalive_interval,
    ));
    if let Some(saved) = load_peer_uuid(&config) {
        tracker.set_uuid(saved);
    }
    let peer_uuid = tracker
        .announce()
        .await
        .map_err(|e| Error::Configuration(format!("cannot reach tracker: {e}")))?;
    save_peer_uuid(&config, &peer_uuid);
    info!("announced as {peer_uuid}");

    let (peers_rx, tracker_handle) =
        Arc::clone(&tracker).spawn_keepalive(Arc::clone(&clock), cancel.clone());

    // Wait briefly for the first peer snapshot so immediate distribution
    // has someone to talk to.
    let mut rx = peers_rx.clone();
    let _ = tokio::time::timeout(Duration::from_secs(2), rx.changed()).await;

    let rpc = Arc::new(PeerClient::new(
        Arc::clone(&db),
        Arc::clone(&clock),
        config.rpc_timeout,
    ));
    let manager = ChunkingManager::new(
        config.clone(),
        peer_uuid.clone(),
        Arc::clone(&db),
        Arc::clone(&store),
        Arc::clone(&rpc),
        peers_rx.clone(),
        Arc::clone(&clock),
        cancel.clone(),
    );
    let replication = ReplicationManager::new(
        config.clone(),
        peer_uuid.clone(),
        Arc::clone(&db),
        Arc::clone(&store),
        Arc::clone(&rpc),
        Arc::clone(&clock),
    );

    Ok(Core {
        config,
        peer_uuid,
        db,
        store,
        clock,
        manager,
        replication,
        cancel,
        handles: vec![tracker_handle],
        peers_rx,
    })
}

impl Core {
    pub(crate) async fn shutdown(self) {
        self.manager.shutdown(self.handles).await;
    }
}

fn peer_uuid_path(config: &Config) -> std::path::PathBuf {
    config.data_dir.join("peer_uuid")
}

/// The tracker keeps per-UUID state, so the assigned UUID is persisted and
/// re-announced across restarts.
fn load_peer_uuid(config: &Config) -> Option<String> {
    let raw = std::fs::read_to_string(peer_uuid_path(config)).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn save_peer_uuid(config: &Config, peer_uuid: &str) {
    if let Err(e) = std::fs::write(peer_uuid_path(config), peer_uuid) {
        warn!("cannot persist peer uuid: {e}");
    }
}

/// Read a passphrase from stdin, re-prompting until it is non-empty.
pub(crate) fn prompt_passphrase(prompt: &str) -> Result<String> {
    loop {
        print!("{prompt}: ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let trimmed = input.trim();
        if trimmed.is_empty() {
            println!("Passphrase cannot be empty.");
            continue;
        }
        return Ok(trimmed.to_string());
    }
}
