use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Role of a chunk within an encoded file.
///
/// Indices `0..k` are raw data shards, `k..k+m` are Reed-Solomon parity,
/// and everything above is an XOR local-recovery symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkRole {
    Data,
    Parity,
    Lrc,
}

impl ChunkRole {
    pub fn for_index(index: usize, k: usize, m: usize) -> ChunkRole {
        if index < k {
            ChunkRole::Data
        } else if index < k + m {
            ChunkRole::Parity
        } else {
            ChunkRole::Lrc
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkRole::Data => "data",
            ChunkRole::Parity => "parity",
            ChunkRole::Lrc => "lrc",
        }
    }
}

impl fmt::Display for ChunkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data" => Ok(ChunkRole::Data),
            "parity" => Ok(ChunkRole::Parity),
            "lrc" => Ok(ChunkRole::Lrc),
            other => Err(Error::Configuration(format!("unknown chunk role: {other}"))),
        }
    }
}

/// One LRC local group: a contiguous run of data chunk indices plus the
/// index of their XOR recovery symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalGroup {
    pub group_id: usize,
    pub chunk_indices: Vec<usize>,
    pub recovery_idx: usize,
}

/// Metadata for one logically chunked file. This is what `metadata.json`
/// holds on disk and what the `file_metadata` table persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_uuid: String,
    pub owner_uuid: String,
    pub original_name: String,
    pub original_size: u64,
    pub original_sha256: String,
    pub k: usize,
    pub m: usize,
    pub chunk_size: usize,
    pub total_chunks: usize,
    pub lrc_group_size: usize,
    pub lrc_groups: Vec<LocalGroup>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// SHA-256 of the plaintext fed to the codec, verified after every
    /// reconstruction.
    pub content_hash: String,
    /// Per-chunk SHA-256 recorded at encode time, indexed by chunk index.
    pub chunk_hashes: Vec<String>,
    /// Set when replication gave up on a lost chunk and reconstruction can
    /// no longer reach K shards.
    #[serde(default)]
    pub degraded: bool,
}

impl FileMetadata {
    pub fn lrc_count(&self) -> usize {
        self.total_chunks - self.k - self.m
    }

    pub fn role_of(&self, index: usize) -> ChunkRole {
        ChunkRole::for_index(index, self.k, self.m)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn chunk_hash(&self, index: usize) -> Option<&str> {
        self.chunk_hashes.get(index).map(String::as_str)
    }
}

/// A chunk byte-blob held locally, as recorded in the `chunks` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub owner_uuid: String,
    pub file_uuid: String,
    pub index: usize,
    pub role: ChunkRole,
    pub size_bytes: u64,
    pub sha256: String,
    pub stored_at: DateTime<Utc>,
}

/// One row of the replication index: which peer holds (or was asked to
/// hold) which chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub file_uuid: String,
    pub index: usize,
    pub peer_uuid: String,
    pub assigned_at: DateTime<Utc>,
    pub confirmed: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// A peer as tracked in the `peers` table. Counters start at 1 so the
/// reliability ratio is Laplace-smoothed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_uuid: String,
    pub ip: String,
    pub port: u16,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub success_count: u64,
    pub failure_count: u64,
}

impl PeerInfo {
    /// Smoothed success ratio in `[0, 1]`.
    pub fn reliability(&self) -> f64 {
        let s = self.success_count as f64;
        let f = self.failure_count as f64;
        s / (s + f)
    }

    /// Placement eligibility: reliable enough and recently seen.
    pub fn is_eligible(
        &self,
        min_reliability: f64,
        now: DateTime<Utc>,
        freshness: chrono::Duration,
    ) -> bool {
        self.reliability() >= min_reliability && now - self.last_seen <= freshness
    }

    pub fn addr(&self) -> PeerAddr {
        PeerAddr {
            uuid: self.peer_uuid.clone(),
            ip: self.ip.clone(),
            port: self.port,
        }
    }
}

/// Address triple published by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub uuid: String,
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Immutable snapshot of the tracker's current peer list. A new snapshot is
/// published on every keepalive; readers never observe a partial list.
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    pub peers: Vec<PeerAddr>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl PeerSet {
    pub fn contains(&self, peer_uuid: &str) -> bool {
        self.peers.iter().any(|p| p.uuid == peer_uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in_progress",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "in_progress" => Ok(TaskState::InProgress),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            other => Err(Error::Configuration(format!("unknown task state: {other}"))),
        }
    }
}

/// A queued relocation of one chunk away from a lost peer.
#[derive(Debug, Clone)]
pub struct ReplicationTask {
    pub id: i64,
    pub file_uuid: String,
    pub index: usize,
    pub lost_peer_uuid: String,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
    pub attempts: u32,
}

/// Aggregate counts surfaced by `get_local_stats`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LocalStats {
    pub file_count: usize,
    pub local_chunk_count: usize,
    pub foreign_chunk_count: usize,
}

/// Read-only availability summary for one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    /// Shards required for reconstruction (K).
    pub required: usize,
    pub available_local: usize,
    pub available_remote: usize,
    /// Distinct chunk indices reachable locally or via a fresh peer.
    pub reachable: usize,
    pub reconstructable: bool,
    pub degraded: bool,
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_boundaries() {
        assert_eq!(ChunkRole::for_index(0, 6, 4), ChunkRole::Data);
        assert_eq!(ChunkRole::for_index(5, 6, 4), ChunkRole::Data);
        assert_eq!(ChunkRole::for_index(6, 6, 4), ChunkRole::Parity);
        assert_eq!(ChunkRole::for_index(9, 6, 4), ChunkRole::Parity);
        assert_eq!(ChunkRole::for_index(10, 6, 4), ChunkRole::Lrc);
    }

    #[test]
    fn reliability_is_laplace_smoothed() {
        let mut peer = PeerInfo {
            peer_uuid: "p1".into(),
            ip: "127.0.0.1".into(),
            port: 6000,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            success_count: 1,
            failure_count: 1,
        };
        // Fresh peer starts at exactly 0.5.
        assert_eq!(peer.reliability(), 0.5);

        peer.success_count = 9;
        assert_eq!(peer.reliability(), 0.9);

        peer.failure_count = 9;
        assert_eq!(peer.reliability(), 0.5);
    }

    #[test]
    fn stale_peer_is_not_eligible() {
        let now = Utc::now();
        let peer = PeerInfo {
            peer_uuid: "p1".into(),
            ip: "127.0.0.1".into(),
            port: 6000,
            first_seen: now - chrono::Duration::hours(1),
            last_seen: now - chrono::Duration::minutes(5),
            success_count: 10,
            failure_count: 1,
        };
        assert!(!peer.is_eligible(0.5, now, chrono::Duration::seconds(45)));
        assert!(peer.is_eligible(0.5, now, chrono::Duration::minutes(10)));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let metadata = FileMetadata {
            file_uuid: "f1".into(),
            owner_uuid: "o1".into(),
            original_name: "container.dat".into(),
            original_size: 1234,
            original_sha256: "abc".into(),
            k: 6,
            m: 4,
            chunk_size: 206,
            total_chunks: 13,
            lrc_group_size: 2,
            lrc_groups: vec![LocalGroup {
                group_id: 0,
                chunk_indices: vec![0, 1],
                recovery_idx: 10,
            }],
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            content_hash: "abc".into(),
            chunk_hashes: vec![String::new(); 13],
            degraded: false,
        };
        let json = serde_json::to_string(&metadata).unwrap();
        let back: FileMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.file_uuid, metadata.file_uuid);
        assert_eq!(back.lrc_groups, metadata.lrc_groups);
        assert_eq!(back.lrc_count(), 3);
    }
}
