use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::codec::ErasureCodec;
use crate::config::Config;
use crate::db::ChunkDb;
use crate::error::{Error, Result};
use crate::models::{
    sha256_hex, ChunkLocation, ChunkRole, FileMetadata, FileStatus, LocalStats, PeerAddr, PeerSet,
    StoredChunk,
};
use crate::replication::ReplicationManager;
use crate::rpc::PeerClient;
use crate::store::ChunkStore;
use crate::CONTAINER_NAME;

/// Outcome of a distribution run. Distribution never raises on peer
/// trouble: failed assignments leave the chunk local and show up here.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DistributionReport {
    pub total_chunks: usize,
    pub distributed: usize,
    pub failed: usize,
    pub local_deleted: usize,
    /// True when no eligible peer existed at all.
    pub no_peers: bool,
}

/// Per-file summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file_uuid: String,
    pub original_name: String,
    pub original_size: u64,
    pub total_chunks: usize,
    pub local_chunks: usize,
    pub confirmed_locations: usize,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub degraded: bool,
}

/// The orchestrator: chunk, distribute, reconstruct, plus the background
/// sweeps and container auto-sync.
///
/// Sub-managers are wired by explicit injection: the manager owns handles
/// to the database, store, RPC client, tracker snapshots and clock, and
/// nothing points back at it.
pub struct ChunkingManager {
    config: Config,
    peer_uuid: String,
    db: Arc<ChunkDb>,
    store: Arc<ChunkStore>,
    rpc: Arc<PeerClient>,
    peers_rx: watch::Receiver<Arc<PeerSet>>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    container_hash: StdMutex<Option<String>>,
    distribution_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChunkingManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        peer_uuid: String,
        db: Arc<ChunkDb>,
        store: Arc<ChunkStore>,
        rpc: Arc<PeerClient>,
        peers_rx: watch::Receiver<Arc<PeerSet>>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ChunkingManager {
            config,
            peer_uuid,
            db,
            store,
            rpc,
            peers_rx,
            clock,
            cancel,
            container_hash: StdMutex::new(None),
            distribution_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn peer_uuid(&self) -> &str {
        &self.peer_uuid
    }

    fn codec(&self, k: usize, m: usize, group_size: usize) -> Result<ErasureCodec> {
        ErasureCodec::new(k, m, group_size)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ChunkStorage(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "operation cancelled",
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // chunking
    // ------------------------------------------------------------------

    /// Chunk a file on disk. Idempotent by `(owner, file name)`: an
    /// existing record under the same name is fully removed first, which
    /// is what makes container auto-sync a plain re-chunk.
    pub async fn chunk_file(&self, path: &Path, owner_uuid: &str) -> Result<String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Configuration(format!("not a file path: {}", path.display())))?;
        let data = tokio::fs::read(path).await?;
        self.chunk_bytes(&name, data, owner_uuid).await
    }

    /// Chunk an in-memory buffer under a logical name.
    pub async fn chunk_bytes(&self, name: &str, data: Vec<u8>, owner_uuid: &str) -> Result<String> {
        self.check_cancelled()?;
        if data.is_empty() {
            return Err(Error::ChunkEncoding(format!("{name} is empty")));
        }

        if let Some(existing) = self.db.get_file_metadata_by_name(owner_uuid, name)? {
            info!(
                "replacing previous record {} for {owner_uuid}/{name}",
                existing.file_uuid
            );
            self.delete_file(&existing.file_uuid, owner_uuid).await?;
        }

        let original_size = data.len() as u64;
        let content_hash = sha256_hex(&data);
        let codec = self.codec(self.config.rs_k, self.config.rs_m, self.config.lrc_group_size)?;

        // RS encoding and hashing are CPU-bound; keep them off the I/O
        // scheduler.
        let encoded = tokio::task::spawn_blocking(move || codec.encode(&data))
            .await
            .map_err(|e| Error::ChunkEncoding(format!("encode task failed: {e}")))??;

        if encoded.chunk_size > self.config.chunk_size {
            warn!(
                "{name}: chunk size {} exceeds the configured {} bytes",
                encoded.chunk_size, self.config.chunk_size
            );
        }

        let file_uuid = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let metadata = FileMetadata {
            file_uuid: file_uuid.clone(),
            owner_uuid: owner_uuid.to_string(),
            original_name: name.to_string(),
            original_size,
            original_sha256: content_hash.clone(),
            k: self.config.rs_k,
            m: self.config.rs_m,
            chunk_size: encoded.chunk_size,
            total_chunks: encoded.chunks.len(),
            lrc_group_size: self.config.lrc_group_size,
            lrc_groups: encoded.groups.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::days(self.config.retention_days),
            content_hash,
            chunk_hashes: encoded.chunk_hashes.clone(),
            degraded: false,
        };

        let mut rows = Vec::with_capacity(encoded.chunks.len());
        for (index, chunk) in encoded.chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                // Roll the partial write back; nothing reached the db yet.
                let _ = self.store.delete_file_chunks(owner_uuid, &file_uuid);
                return Err(Error::ChunkStorage(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "operation cancelled",
                )));
            }
            self.store.store_chunk(owner_uuid, &file_uuid, index, chunk)?;
            rows.push(StoredChunk {
                owner_uuid: owner_uuid.to_string(),
                file_uuid: file_uuid.clone(),
                index,
                role: metadata.role_of(index),
                size_bytes: chunk.len() as u64,
                sha256: encoded.chunk_hashes[index].clone(),
                stored_at: now,
            });
        }

        self.store.store_metadata(&metadata)?;
        self.db.register_file(&metadata, &rows)?;

        info!(
            "chunked {owner_uuid}/{name} into {} chunks as {file_uuid}",
            metadata.total_chunks
        );
        Ok(file_uuid)
    }

    // ------------------------------------------------------------------
    // distribution
    // ------------------------------------------------------------------

    /// Push local chunks out to eligible peers, round-robin over ascending
    /// chunk indices. Confirmed transfers drop the local copy; failed ones
    /// keep it and are reported, never raised.
    pub async fn distribute_chunks(&self, file_uuid: &str, owner_uuid: &str) -> Result<DistributionReport> {
        let lock = {
            let mut locks = self.distribution_locks.lock().await;
            Arc::clone(locks.entry(file_uuid.to_string()).or_default())
        };
        let _guard = lock.lock().await;

        let metadata = self
            .db
            .get_file_metadata(file_uuid)?
            .ok_or_else(|| Error::FileMetadataNotFound(file_uuid.to_string()))?;

        let mut report = DistributionReport {
            total_chunks: metadata.total_chunks,
            ..DistributionReport::default()
        };

        let local: Vec<StoredChunk> = self
            .db
            .get_chunks_by_file(file_uuid)?
            .into_iter()
            .filter(|c| c.owner_uuid == owner_uuid)
            .collect();
        if local.is_empty() {
            debug!("no local chunks for {file_uuid}, nothing to distribute");
            return Ok(report);
        }

        let peers = match self.eligible_peers() {
            Ok(peers) => peers,
            Err(Error::NoPeersAvailable) => {
                warn!("no eligible peers, chunks of {file_uuid} stay local");
                report.no_peers = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        // Spread before duplicating: when there are more eligible peers
        // than chunks, a peer gets at most one chunk of this file.
        let spread = peers.len() > metadata.total_chunks;
        let mut holders: HashSet<String> = self
            .db
            .get_locations_by_file(file_uuid)?
            .into_iter()
            .map(|l| l.peer_uuid)
            .collect();
        let mut cursor = 0usize;

        info!(
            "distributing {} chunks of {file_uuid} across {} peer(s)",
            local.len(),
            peers.len()
        );

        for chunk in &local {
            self.check_cancelled()?;
            let Some(peer) = pick_peer(&peers, &mut cursor, spread.then_some(&holders)) else {
                report.failed += 1;
                continue;
            };
            holders.insert(peer.uuid.clone());

            let now = self.clock.now();
            let assignment = ChunkLocation {
                file_uuid: file_uuid.to_string(),
                index: chunk.index,
                peer_uuid: peer.uuid.clone(),
                assigned_at: now,
                confirmed: false,
                last_seen_at: now,
            };
            self.db.insert_assignment(&assignment)?;

            let Some(data) = self.store.get_chunk(owner_uuid, file_uuid, chunk.index)? else {
                warn!("chunk {file_uuid}#{} missing on disk, skipping", chunk.index);
                self.db.delete_assignment(file_uuid, chunk.index, &peer.uuid)?;
                report.failed += 1;
                continue;
            };

            let sent = self
                .push_chunk_with_retry(&peer, owner_uuid, file_uuid, chunk.index, chunk.role, &chunk.sha256, &data)
                .await;

            if sent {
                let now = self.clock.now();
                self.db.upsert_location(&ChunkLocation {
                    confirmed: true,
                    last_seen_at: now,
                    ..assignment
                })?;
                self.db.delete_assignment(file_uuid, chunk.index, &peer.uuid)?;

                // The owner keeps no redundant copy once a peer confirmed.
                self.store.delete_chunk(owner_uuid, file_uuid, chunk.index)?;
                self.db.delete_chunk_row(owner_uuid, file_uuid, chunk.index)?;
                report.local_deleted += 1;
                report.distributed += 1;
            } else {
                // The assignment row is omitted and the chunk stays local.
                self.db.delete_assignment(file_uuid, chunk.index, &peer.uuid)?;
                report.failed += 1;
            }
        }

        info!(
            "distribution of {file_uuid}: {}/{} confirmed, {} failed",
            report.distributed,
            local.len(),
            report.failed
        );
        Ok(report)
    }

    /// `store_chunk` with the standard retry policy: up to `max_retries`
    /// retries with exponential backoff after the first attempt.
    async fn push_chunk_with_retry(
        &self,
        peer: &PeerAddr,
        owner_uuid: &str,
        file_uuid: &str,
        index: usize,
        role: ChunkRole,
        sha256: &str,
        data: &[u8],
    ) -> bool {
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_delay * 2u32.pow(attempt - 1);
                debug!("retry {attempt}/{} for chunk {index} to {} in {backoff:?}", self.config.max_retries, peer.uuid);
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            match self
                .rpc
                .store_chunk(peer, owner_uuid, file_uuid, index, role, sha256, data)
                .await
            {
                Ok(()) => return true,
                Err(e) => warn!("store_chunk {file_uuid}#{index} on {} failed: {e}", peer.uuid),
            }
        }
        false
    }

    /// Current placement-eligible peers, most reliable first.
    ///
    /// Peers from the latest tracker snapshot are folded into the database
    /// first, then filtered on reliability and freshness.
    fn eligible_peers(&self) -> Result<Vec<PeerAddr>> {
        let snapshot = self.peers_rx.borrow().clone();
        let now = self.clock.now();
        for peer in &snapshot.peers {
            if peer.uuid != self.peer_uuid {
                self.db.upsert_peer(peer, now)?;
            }
        }

        let freshness = self.config.peer_freshness_window();
        let mut eligible: Vec<_> = self
            .db
            .list_peers()?
            .into_iter()
            .filter(|p| p.peer_uuid != self.peer_uuid)
            .filter(|p| p.is_eligible(self.config.min_reliability, now, freshness))
            .collect();
        eligible.sort_by(|a, b| {
            b.reliability()
                .partial_cmp(&a.reliability())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if eligible.is_empty() {
            return Err(Error::NoPeersAvailable);
        }
        Ok(eligible.iter().map(|p| p.addr()).collect())
    }

    // ------------------------------------------------------------------
    // reconstruction
    // ------------------------------------------------------------------

    /// Rebuild a file from local and remote chunks, verify its content
    /// hash and optionally write it out atomically.
    pub async fn reconstruct_file(
        &self,
        file_uuid: &str,
        owner_uuid: &str,
        output_path: Option<&Path>,
    ) -> Result<Vec<u8>> {
        let metadata = match self.db.get_file_metadata(file_uuid)? {
            Some(metadata) => metadata,
            // Fall back to the on-disk copy, which survives db loss.
            None => self
                .store
                .load_metadata(owner_uuid, file_uuid)?
                .ok_or_else(|| Error::FileMetadataNotFound(file_uuid.to_string()))?,
        };

        info!(
            "reconstructing {file_uuid} ({}, {} bytes)",
            metadata.original_name, metadata.original_size
        );

        let codec = self.codec(metadata.k, metadata.m, metadata.lrc_group_size)?;
        let mut held = self.collect_local_chunks(&metadata, owner_uuid)?;

        // Fetch missing chunks in the codec's preference order, stopping
        // the moment reconstruction becomes possible.
        let mut held_indices: BTreeSet<usize> = held.keys().copied().collect();
        if !codec.can_decode(&held_indices) {
            for index in codec.fetch_priority(&held_indices) {
                self.check_cancelled()?;
                if codec.can_decode(&held_indices) {
                    break;
                }
                if let Some(data) = self.fetch_remote_chunk(&metadata, owner_uuid, index).await? {
                    held.insert(index, data);
                    held_indices.insert(index);
                }
            }
        }

        if !codec.can_decode(&held_indices) {
            warn!(
                "{file_uuid} is not reconstructable: {} of {} required shards reachable",
                held_indices.len(),
                metadata.k
            );
            self.db.set_file_degraded(file_uuid, true)?;
            return Err(Error::InsufficientChunks {
                available: held_indices.len(),
                required: metadata.k,
            });
        }

        let chunk_hashes = metadata.chunk_hashes.clone();
        let original_size = metadata.original_size;
        let content_hash = metadata.content_hash.clone();
        let data = tokio::task::spawn_blocking(move || {
            codec.decode(&held, &chunk_hashes, original_size, &content_hash)
        })
        .await
        .map_err(|e| Error::ChunkDecoding(format!("decode task failed: {e}")))??;

        if metadata.degraded {
            self.db.set_file_degraded(file_uuid, false)?;
        }

        if let Some(path) = output_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("reconstruct.tmp");
            std::fs::write(&tmp, &data)?;
            std::fs::rename(&tmp, path)?;
            info!("reconstructed file written to {}", path.display());
        }
        Ok(data)
    }

    /// Valid local chunks keyed by index. Corrupt ones are dropped and
    /// counted as lost.
    fn collect_local_chunks(
        &self,
        metadata: &FileMetadata,
        owner_uuid: &str,
    ) -> Result<BTreeMap<usize, Vec<u8>>> {
        // Interrupted writes may have left .tmp files behind.
        self.store.remove_stale_tmp(owner_uuid, &metadata.file_uuid)?;

        let mut held = BTreeMap::new();
        for index in self.store.list_chunks(owner_uuid, &metadata.file_uuid)? {
            if index >= metadata.total_chunks {
                continue;
            }
            let Some(data) = self.store.get_chunk(owner_uuid, &metadata.file_uuid, index)? else {
                continue;
            };
            match metadata.chunk_hash(index) {
                Some(expected) if sha256_hex(&data) != expected => {
                    warn!("local chunk {}#{index} is corrupt, ignoring", metadata.file_uuid);
                }
                _ => {
                    held.insert(index, data);
                }
            }
        }
        Ok(held)
    }

    /// Try all confirmed holders of one chunk, most reliable peer first.
    async fn fetch_remote_chunk(
        &self,
        metadata: &FileMetadata,
        owner_uuid: &str,
        index: usize,
    ) -> Result<Option<Vec<u8>>> {
        let mut locations: Vec<(f64, PeerAddr)> = Vec::new();
        for location in self.db.get_locations(&metadata.file_uuid, index)? {
            if !location.confirmed {
                continue;
            }
            if let Some(peer) = self.db.get_peer(&location.peer_uuid)? {
                locations.push((peer.reliability(), peer.addr()));
            }
        }
        locations.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (_, peer) in locations {
            match self
                .rpc
                .get_chunk(&peer, owner_uuid, &metadata.file_uuid, index)
                .await
            {
                Ok((data, _)) => {
                    let valid = match metadata.chunk_hash(index) {
                        Some(expected) => sha256_hex(&data) == expected,
                        None => true,
                    };
                    if valid {
                        debug!("chunk {index} fetched from {}", peer.uuid);
                        return Ok(Some(data));
                    }
                    warn!("peer {} returned a corrupt copy of chunk {index}", peer.uuid);
                }
                Err(e) => debug!("chunk {index} not available from {}: {e}", peer.uuid),
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // status, listing, deletion
    // ------------------------------------------------------------------

    /// Pure read: how much of the file is reachable right now.
    pub fn get_file_status(&self, file_uuid: &str) -> Result<FileStatus> {
        let metadata = self
            .db
            .get_file_metadata(file_uuid)?
            .ok_or_else(|| Error::FileMetadataNotFound(file_uuid.to_string()))?;
        let codec = self.codec(metadata.k, metadata.m, metadata.lrc_group_size)?;
        let now = self.clock.now();
        let freshness = self.config.peer_freshness_window();

        let local: BTreeSet<usize> = self
            .db
            .get_chunks_by_file(file_uuid)?
            .into_iter()
            .filter(|c| c.owner_uuid == metadata.owner_uuid)
            .map(|c| c.index)
            .collect();

        let mut remote: BTreeSet<usize> = BTreeSet::new();
        let mut reachable: BTreeSet<usize> = local.clone();
        for location in self.db.get_locations_by_file(file_uuid)? {
            if !location.confirmed {
                continue;
            }
            remote.insert(location.index);
            // A holder counts as reachable while it is fresh and has not
            // burned its reliability.
            let reachable_peer = self
                .db
                .get_peer(&location.peer_uuid)?
                .is_some_and(|p| p.is_eligible(self.config.min_reliability, now, freshness));
            if reachable_peer {
                reachable.insert(location.index);
            }
        }

        Ok(FileStatus {
            required: metadata.k,
            available_local: local.len(),
            available_remote: remote.len(),
            reachable: reachable.len(),
            reconstructable: codec.can_decode(&reachable),
            degraded: metadata.degraded,
        })
    }

    pub fn list_files(&self, owner_uuid: &str) -> Result<Vec<FileSummary>> {
        let mut summaries = Vec::new();
        for metadata in self.db.list_files_by_owner(owner_uuid)? {
            let local = self
                .db
                .get_chunks_by_file(&metadata.file_uuid)?
                .into_iter()
                .filter(|c| c.owner_uuid == owner_uuid)
                .count();
            let confirmed = self
                .db
                .get_locations_by_file(&metadata.file_uuid)?
                .into_iter()
                .filter(|l| l.confirmed)
                .count();
            summaries.push(FileSummary {
                file_uuid: metadata.file_uuid,
                original_name: metadata.original_name,
                original_size: metadata.original_size,
                total_chunks: metadata.total_chunks,
                local_chunks: local,
                confirmed_locations: confirmed,
                expires_at: metadata.expires_at,
                degraded: metadata.degraded,
            });
        }
        Ok(summaries)
    }

    pub fn get_stats(&self) -> Result<LocalStats> {
        self.db.get_local_stats(&self.peer_uuid)
    }

    /// Remove a file everywhere: local chunks and db rows always, remote
    /// copies best-effort.
    pub async fn delete_file(&self, file_uuid: &str, owner_uuid: &str) -> Result<()> {
        for location in self.db.get_locations_by_file(file_uuid)? {
            if !location.confirmed {
                continue;
            }
            let Some(peer) = self.db.get_peer(&location.peer_uuid)? else {
                continue;
            };
            if let Err(e) = self
                .rpc
                .delete_chunk(&peer.addr(), owner_uuid, file_uuid, location.index)
                .await
            {
                debug!("remote delete of {file_uuid}#{} on {} failed: {e}", location.index, location.peer_uuid);
            }
        }
        self.store.delete_file_chunks(owner_uuid, file_uuid)?;
        self.db.remove_file(file_uuid)?;
        info!("deleted file {file_uuid}");
        Ok(())
    }

    /// Drop every file whose retention window has passed. Returns how many
    /// files were removed.
    pub async fn cleanup_expired_files(&self) -> Result<usize> {
        let expired = self.db.expired_files(self.clock.now())?;
        let count = expired.len();
        for metadata in expired {
            info!(
                "retention expired for {} ({})",
                metadata.file_uuid, metadata.original_name
            );
            if let Err(e) = self.delete_file(&metadata.file_uuid, &metadata.owner_uuid).await {
                warn!("failed to remove expired file {}: {e}", metadata.file_uuid);
            }
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // container auto-sync
    // ------------------------------------------------------------------

    /// Re-chunk and re-distribute the container if its bytes changed since
    /// the last sync. No-op when the hash is unchanged or the container
    /// does not exist yet.
    pub async fn sync_container(&self) -> Result<Option<String>> {
        let path = self.config.container_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read(&path).await?;
        let hash = sha256_hex(&data);

        {
            let cached = self.container_hash.lock().unwrap_or_else(|e| e.into_inner());
            if cached.as_deref() == Some(hash.as_str()) {
                return Ok(None);
            }
        }

        info!("container changed, re-chunking");
        let owner = self.peer_uuid.clone();
        // chunk_bytes removes the previous container record, local chunks
        // and (best-effort) its remote copies.
        let file_uuid = self.chunk_bytes(CONTAINER_NAME, data, &owner).await?;
        let report = self.distribute_chunks(&file_uuid, &owner).await?;
        if report.no_peers {
            debug!("container chunks kept local until peers appear");
        }

        let mut cached = self.container_hash.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some(hash);
        Ok(Some(file_uuid))
    }

    /// On startup: if the container file is gone but its metadata
    /// survives, pull it back from the network.
    pub async fn restore_container_on_start(&self) -> Result<Option<PathBuf>> {
        let path = self.config.container_path();
        if path.exists() {
            let data = tokio::fs::read(&path).await?;
            let mut cached = self.container_hash.lock().unwrap_or_else(|e| e.into_inner());
            *cached = Some(sha256_hex(&data));
            return Ok(None);
        }

        let Some(metadata) = self
            .db
            .get_file_metadata_by_name(&self.peer_uuid, CONTAINER_NAME)?
        else {
            return Ok(None);
        };

        info!("local container missing, recovering {} from the network", metadata.file_uuid);
        let data = self
            .reconstruct_file(&metadata.file_uuid, &self.peer_uuid, Some(&path))
            .await?;

        let mut cached = self.container_hash.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some(sha256_hex(&data));
        Ok(Some(path))
    }

    // ------------------------------------------------------------------
    // background tasks
    // ------------------------------------------------------------------

    /// Launch the periodic sweeps and the peer-set subscriber. All tasks
    /// stop when the shared cancellation token fires.
    pub fn start_background_tasks(
        self: &Arc<Self>,
        replication: Arc<ReplicationManager>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Replication sweep.
        {
            let replication = Arc::clone(&replication);
            let cancel = self.cancel.clone();
            let period = self.config.replication_sweep_interval;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {}
                    }
                    if let Err(e) = replication.process_pending_relocations().await {
                        warn!("replication sweep failed: {e}");
                    }
                }
            }));
        }

        // Expiry sweep.
        {
            let manager = Arc::clone(self);
            let replication = Arc::clone(&replication);
            let cancel = self.cancel.clone();
            let period = self.config.expiry_sweep_interval;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {}
                    }
                    if let Err(e) = manager.cleanup_expired_files().await {
                        warn!("expiry sweep failed: {e}");
                    }
                    if let Err(e) = replication.cleanup_expired_chunks().await {
                        warn!("foreign chunk expiry sweep failed: {e}");
                    }
                }
            }));
        }

        // Peer-set refresh: fold tracker snapshots into the peer table and
        // hand losses to the replication manager.
        {
            let manager = Arc::clone(self);
            let replication = Arc::clone(&replication);
            let cancel = self.cancel.clone();
            let mut peers_rx = self.peers_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = peers_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    let snapshot = peers_rx.borrow_and_update().clone();
                    let now = manager.clock.now();
                    for peer in &snapshot.peers {
                        if peer.uuid != manager.peer_uuid {
                            if let Err(e) = manager.db.upsert_peer(peer, now) {
                                warn!("peer upsert failed: {e}");
                            }
                        }
                    }
                    for lost in replication.observe_peer_set(&snapshot) {
                        info!("peer {lost} declared lost");
                        if let Err(e) = replication.on_peer_disconnected(&lost) {
                            warn!("failed to queue relocations for {lost}: {e}");
                        }
                    }
                }
            }));
        }

        // Container auto-sync poll.
        {
            let manager = Arc::clone(self);
            let cancel = self.cancel.clone();
            let period = self.config.keepalive_interval * 2;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {}
                    }
                    if let Err(e) = manager.sync_container().await {
                        warn!("container sync failed: {e}");
                    }
                }
            }));
        }

        handles
    }

    /// Stop all background work. Waits up to 5 seconds for in-flight
    /// tasks, then aborts the stragglers and flushes the database.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("background task did not stop in time, aborting");
                handle.abort();
            }
        }
        if let Err(e) = self.db.flush() {
            warn!("database flush on shutdown failed: {e}");
        }
        info!("chunking manager stopped");
    }
}

/// Round-robin peer pick. With `exclude` set (spread mode), peers already
/// holding a chunk of the file are skipped.
fn pick_peer<'a>(
    peers: &'a [PeerAddr],
    cursor: &mut usize,
    exclude: Option<&HashSet<String>>,
) -> Option<&'a PeerAddr> {
    if peers.is_empty() {
        return None;
    }
    for _ in 0..peers.len() {
        let peer = &peers[*cursor % peers.len()];
        *cursor += 1;
        if let Some(excluded) = exclude {
            if excluded.contains(&peer.uuid) {
                continue;
            }
        }
        return Some(peer);
    }
    // Spread mode with every peer excluded: fall back to plain rotation.
    let peer = &peers[*cursor % peers.len()];
    *cursor += 1;
    Some(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<PeerAddr> {
        (0..n)
            .map(|i| PeerAddr {
                uuid: format!("p{i}"),
                ip: "127.0.0.1".into(),
                port: 6000 + i as u16,
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles() {
        let peers = peers(3);
        let mut cursor = 0;
        let picked: Vec<_> = (0..5)
            .map(|_| pick_peer(&peers, &mut cursor, None).unwrap().uuid.clone())
            .collect();
        assert_eq!(picked, vec!["p0", "p1", "p2", "p0", "p1"]);
    }

    #[test]
    fn spread_mode_skips_holders() {
        let peers = peers(4);
        let mut cursor = 0;
        let mut holders: HashSet<String> = HashSet::new();
        holders.insert("p0".into());
        holders.insert("p1".into());

        let picked = pick_peer(&peers, &mut cursor, Some(&holders)).unwrap();
        assert_eq!(picked.uuid, "p2");
        let picked = pick_peer(&peers, &mut cursor, Some(&holders)).unwrap();
        assert_eq!(picked.uuid, "p3");
    }

    #[test]
    fn spread_mode_with_all_excluded_still_picks() {
        let peers = peers(2);
        let mut cursor = 0;
        let holders: HashSet<String> = peers.iter().map(|p| p.uuid.clone()).collect();
        assert!(pick_peer(&peers, &mut cursor, Some(&holders)).is_some());
    }

    #[test]
    fn empty_peer_list_yields_none() {
        let mut cursor = 0;
        assert!(pick_peer(&[], &mut cursor, None).is_none());
    }
}
