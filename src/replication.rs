use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::clock::Clock;
use crate::codec::ErasureCodec;
use crate::config::Config;
use crate::db::ChunkDb;
use crate::error::{Error, Result};
use crate::models::{sha256_hex, ChunkLocation, FileMetadata, PeerSet, ReplicationTask, TaskState};
use crate::rpc::PeerClient;
use crate::store::ChunkStore;

/// Reacts to peer loss by relocating the chunks the lost peer held.
///
/// Two event sources feed it: tracker snapshots (a peer absent for longer
/// than the loss threshold) and reliability decay from repeated RPC
/// failures. Work is queued as replication tasks in the database and
/// drained by the periodic sweep.
pub struct ReplicationManager {
    config: Config,
    peer_uuid: String,
    db: Arc<ChunkDb>,
    store: Arc<ChunkStore>,
    rpc: Arc<PeerClient>,
    clock: Arc<dyn Clock>,
    /// Last time each peer appeared in a tracker snapshot.
    presence: StdMutex<HashMap<String, DateTime<Utc>>>,
}

impl ReplicationManager {
    pub fn new(
        config: Config,
        peer_uuid: String,
        db: Arc<ChunkDb>,
        store: Arc<ChunkStore>,
        rpc: Arc<PeerClient>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(ReplicationManager {
            config,
            peer_uuid,
            db,
            store,
            rpc,
            clock,
            presence: StdMutex::new(HashMap::new()),
        })
    }

    /// Fold a tracker snapshot into the presence map and return the peers
    /// that have now been absent longer than the loss threshold. Each lost
    /// peer is reported exactly once.
    pub fn observe_peer_set(&self, snapshot: &PeerSet) -> Vec<String> {
        let now = self.clock.now();
        let threshold = self.config.peer_freshness_window();
        let mut presence = self.presence.lock().unwrap_or_else(|e| e.into_inner());

        for peer in &snapshot.peers {
            presence.insert(peer.uuid.clone(), now);
        }

        let lost: Vec<String> = presence
            .iter()
            .filter(|(uuid, last_seen)| {
                !snapshot.contains(uuid) && now - **last_seen > threshold
            })
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in &lost {
            presence.remove(uuid);
        }
        lost
    }

    /// Queue one relocation per chunk the lost peer held. Returns how many
    /// tasks were created.
    pub fn on_peer_disconnected(&self, peer_uuid: &str) -> Result<usize> {
        let now = self.clock.now();
        let mut created = 0;
        for location in self.db.get_locations_by_peer(peer_uuid)? {
            if !location.confirmed {
                continue;
            }
            if self
                .db
                .create_replication_task(&location.file_uuid, location.index, peer_uuid, now)?
            {
                created += 1;
            }
        }
        if created > 0 {
            info!("queued {created} relocations for lost peer {peer_uuid}");
        }
        Ok(created)
    }

    /// Drain the pending task queue. Returns how many relocations
    /// completed this sweep.
    pub async fn process_pending_relocations(&self) -> Result<usize> {
        self.queue_unreliable_holders()?;

        let tasks = self.db.pending_replication_tasks()?;
        let mut completed = 0;
        for task in tasks {
            match self.process_task(&task).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "relocation of {}#{} failed: {e}",
                        task.file_uuid, task.index
                    );
                    self.db.update_task_state(task.id, TaskState::Pending)?;
                }
            }
        }
        Ok(completed)
    }

    /// Peers whose reliability fell below the placement floor are treated
    /// like disconnected peers for every chunk they hold.
    fn queue_unreliable_holders(&self) -> Result<()> {
        for peer in self.db.list_peers()? {
            if peer.peer_uuid == self.peer_uuid {
                continue;
            }
            if peer.reliability() < self.config.min_reliability
                && !self.db.get_locations_by_peer(&peer.peer_uuid)?.is_empty()
            {
                debug!(
                    "peer {} reliability {:.2} below threshold",
                    peer.peer_uuid,
                    peer.reliability()
                );
                self.on_peer_disconnected(&peer.peer_uuid)?;
            }
        }
        Ok(())
    }

    async fn process_task(&self, task: &ReplicationTask) -> Result<bool> {
        self.db.update_task_state(task.id, TaskState::InProgress)?;
        let attempts = self.db.bump_task_attempts(task.id)?;
        if attempts > self.config.max_retries {
            warn!(
                "relocation of {}#{} gave up after {} attempts",
                task.file_uuid, task.index, attempts
            );
            self.db.update_task_state(task.id, TaskState::Failed)?;
            self.db.set_file_degraded(&task.file_uuid, true)?;
            return Ok(false);
        }

        let Some(metadata) = self.db.get_file_metadata(&task.file_uuid)? else {
            // File disappeared (deleted or expired); drop the stale rows.
            self.db
                .delete_location(&task.file_uuid, task.index, &task.lost_peer_uuid)?;
            self.db.update_task_state(task.id, TaskState::Done)?;
            return Ok(false);
        };

        let mut exclude: HashSet<String> = self
            .db
            .get_locations(&task.file_uuid, task.index)?
            .into_iter()
            .map(|l| l.peer_uuid)
            .collect();
        exclude.insert(task.lost_peer_uuid.clone());

        let Some(replacement) = self.select_replacement_peer(&exclude)? else {
            debug!("no replacement peer available, leaving task pending");
            self.db.update_task_state(task.id, TaskState::Pending)?;
            return Ok(false);
        };

        let Some(data) = self
            .obtain_chunk(&metadata, task.index, &task.lost_peer_uuid)
            .await?
        else {
            warn!(
                "no fetchable copy of {}#{} and local rebuild failed",
                task.file_uuid, task.index
            );
            self.db.update_task_state(task.id, TaskState::Failed)?;
            self.db.set_file_degraded(&task.file_uuid, true)?;
            self.db.record_replication(
                &task.file_uuid,
                task.index,
                &task.lost_peer_uuid,
                "",
                self.clock.now(),
                false,
            )?;
            return Ok(false);
        };

        let sha256 = sha256_hex(&data);
        let now = self.clock.now();
        match self
            .rpc
            .store_chunk(
                &replacement,
                &metadata.owner_uuid,
                &task.file_uuid,
                task.index,
                metadata.role_of(task.index),
                &sha256,
                &data,
            )
            .await
        {
            Ok(()) => {
                self.db.upsert_location(&ChunkLocation {
                    file_uuid: task.file_uuid.clone(),
                    index: task.index,
                    peer_uuid: replacement.uuid.clone(),
                    assigned_at: now,
                    confirmed: true,
                    last_seen_at: now,
                })?;
                self.db
                    .delete_location(&task.file_uuid, task.index, &task.lost_peer_uuid)?;
                self.db.update_task_state(task.id, TaskState::Done)?;
                self.db.record_replication(
                    &task.file_uuid,
                    task.index,
                    &task.lost_peer_uuid,
                    &replacement.uuid,
                    now,
                    true,
                )?;
                info!(
                    "chunk {}#{} relocated from {} to {}",
                    task.file_uuid, task.index, task.lost_peer_uuid, replacement.uuid
                );
                Ok(true)
            }
            Err(e) => {
                warn!("push to replacement {} failed: {e}", replacement.uuid);
                self.db.record_replication(
                    &task.file_uuid,
                    task.index,
                    &task.lost_peer_uuid,
                    &replacement.uuid,
                    now,
                    false,
                )?;
                self.db.update_task_state(task.id, TaskState::Pending)?;
                Ok(false)
            }
        }
    }

    /// Most reliable eligible peer not already holding this chunk.
    fn select_replacement_peer(
        &self,
        exclude: &HashSet<String>,
    ) -> Result<Option<crate::models::PeerAddr>> {
        let now = self.clock.now();
        let freshness = self.config.peer_freshness_window();
        let mut candidates: Vec<_> = self
            .db
            .list_peers()?
            .into_iter()
            .filter(|p| p.peer_uuid != self.peer_uuid)
            .filter(|p| !exclude.contains(&p.peer_uuid))
            .filter(|p| p.is_eligible(self.config.min_reliability, now, freshness))
            .collect();
        candidates.sort_by(|a, b| {
            b.reliability()
                .partial_cmp(&a.reliability())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates.first().map(|p| p.addr()))
    }

    /// Find a valid copy of the chunk: local store, then confirmed remote
    /// holders (highest reliability first, lost peer excluded), then a
    /// full local rebuild through the codec.
    async fn obtain_chunk(
        &self,
        metadata: &FileMetadata,
        index: usize,
        lost_peer_uuid: &str,
    ) -> Result<Option<Vec<u8>>> {
        let expected = metadata.chunk_hash(index);

        if let Some(data) = self
            .store
            .get_chunk(&metadata.owner_uuid, &metadata.file_uuid, index)?
        {
            if expected.is_none_or(|h| sha256_hex(&data) == h) {
                return Ok(Some(data));
            }
            warn!("local copy of {}#{index} is corrupt", metadata.file_uuid);
        }

        let mut holders: Vec<(f64, crate::models::PeerAddr)> = Vec::new();
        for location in self.db.get_locations(&metadata.file_uuid, index)? {
            if !location.confirmed
                || location.peer_uuid == lost_peer_uuid
                || location.peer_uuid == self.peer_uuid
            {
                continue;
            }
            if let Some(peer) = self.db.get_peer(&location.peer_uuid)? {
                holders.push((peer.reliability(), peer.addr()));
            }
        }
        holders.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (_, peer) in holders {
            match self
                .rpc
                .get_chunk(&peer, &metadata.owner_uuid, &metadata.file_uuid, index)
                .await
            {
                Ok((data, _)) => {
                    if expected.is_none_or(|h| sha256_hex(&data) == h) {
                        return Ok(Some(data));
                    }
                    warn!("peer {} served a corrupt copy of chunk {index}", peer.uuid);
                }
                Err(e) => debug!("holder {} cannot serve chunk {index}: {e}", peer.uuid),
            }
        }

        self.rebuild_chunk(metadata, index).await
    }

    /// Last resort: reconstruct the whole file from whatever shards are
    /// reachable and re-encode it to regenerate the lost chunk.
    async fn rebuild_chunk(&self, metadata: &FileMetadata, index: usize) -> Result<Option<Vec<u8>>> {
        let codec = ErasureCodec::new(metadata.k, metadata.m, metadata.lrc_group_size)?;

        let mut held: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for idx in self
            .store
            .list_chunks(&metadata.owner_uuid, &metadata.file_uuid)?
        {
            if idx >= metadata.total_chunks {
                continue;
            }
            if let Some(data) = self
                .store
                .get_chunk(&metadata.owner_uuid, &metadata.file_uuid, idx)?
            {
                held.insert(idx, data);
            }
        }

        let mut held_indices: BTreeSet<usize> = held.keys().copied().collect();
        if !codec.can_decode(&held_indices) {
            for idx in codec.fetch_priority(&held_indices) {
                if codec.can_decode(&held_indices) {
                    break;
                }
                for location in self.db.get_locations(&metadata.file_uuid, idx)? {
                    if !location.confirmed {
                        continue;
                    }
                    let Some(peer) = self.db.get_peer(&location.peer_uuid)? else {
                        continue;
                    };
                    if let Ok((data, _)) = self
                        .rpc
                        .get_chunk(&peer.addr(), &metadata.owner_uuid, &metadata.file_uuid, idx)
                        .await
                    {
                        if metadata.chunk_hash(idx).is_none_or(|h| sha256_hex(&data) == h) {
                            held.insert(idx, data);
                            held_indices.insert(idx);
                            break;
                        }
                    }
                }
            }
        }

        if !codec.can_decode(&held_indices) {
            return Ok(None);
        }

        let chunk_hashes = metadata.chunk_hashes.clone();
        let original_size = metadata.original_size;
        let content_hash = metadata.content_hash.clone();
        let chunk = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let data = codec.decode(&held, &chunk_hashes, original_size, &content_hash)?;
            let encoded = codec.encode(&data)?;
            encoded
                .chunks
                .into_iter()
                .nth(index)
                .ok_or_else(|| Error::Replication(format!("chunk index {index} out of range")))
        })
        .await
        .map_err(|e| Error::Replication(format!("rebuild task failed: {e}")))??;

        info!("chunk {}#{index} regenerated via the codec", metadata.file_uuid);
        Ok(Some(chunk))
    }

    /// Drop chunks whose owning file has passed its retention window:
    /// locally always, remotely best-effort.
    pub async fn cleanup_expired_chunks(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for metadata in self.db.expired_files(now)? {
            for location in self.db.get_locations_by_file(&metadata.file_uuid)? {
                if !location.confirmed {
                    continue;
                }
                let Some(peer) = self.db.get_peer(&location.peer_uuid)? else {
                    continue;
                };
                if let Err(e) = self
                    .rpc
                    .delete_chunk(&peer.addr(), &metadata.owner_uuid, &metadata.file_uuid, location.index)
                    .await
                {
                    debug!(
                        "remote expiry delete of {}#{} failed: {e}",
                        metadata.file_uuid, location.index
                    );
                }
            }
            removed += self
                .store
                .delete_file_chunks(&metadata.owner_uuid, &metadata.file_uuid)?;
            self.db.remove_file(&metadata.file_uuid)?;
            info!("expired file {} swept", metadata.file_uuid);
        }
        Ok(removed)
    }
}
