use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::error::Result;
use crate::models::{
    ChunkLocation, ChunkRole, FileMetadata, LocalStats, PeerAddr, PeerInfo, ReplicationTask,
    StoredChunk, TaskState,
};

/// Forward-only migrations. The `schema_version` row records how many of
/// these have been applied; new entries are appended, never edited.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    "
    CREATE TABLE file_metadata (
        file_uuid         TEXT PRIMARY KEY,
        owner_uuid        TEXT NOT NULL,
        original_name     TEXT NOT NULL,
        original_size     INTEGER NOT NULL,
        original_sha256   TEXT NOT NULL,
        k                 INTEGER NOT NULL,
        m                 INTEGER NOT NULL,
        chunk_size        INTEGER NOT NULL,
        total_chunks      INTEGER NOT NULL,
        lrc_group_size    INTEGER NOT NULL,
        lrc_groups_blob   TEXT NOT NULL,
        chunk_hashes_blob TEXT NOT NULL,
        created_at        TEXT NOT NULL,
        expires_at        TEXT NOT NULL,
        content_hash      TEXT NOT NULL,
        degraded          INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_file_metadata_owner_name
        ON file_metadata (owner_uuid, original_name);

    CREATE TABLE chunks (
        owner_uuid TEXT NOT NULL,
        file_uuid  TEXT NOT NULL,
        idx        INTEGER NOT NULL,
        role       TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        sha256     TEXT NOT NULL,
        stored_at  TEXT NOT NULL,
        PRIMARY KEY (owner_uuid, file_uuid, idx)
    );

    CREATE TABLE chunk_locations (
        file_uuid    TEXT NOT NULL,
        idx          INTEGER NOT NULL,
        peer_uuid    TEXT NOT NULL,
        assigned_at  TEXT NOT NULL,
        confirmed    INTEGER NOT NULL DEFAULT 0,
        last_seen_at TEXT NOT NULL,
        PRIMARY KEY (file_uuid, idx, peer_uuid)
    );
    CREATE INDEX idx_chunk_locations_peer ON chunk_locations (peer_uuid);

    CREATE TABLE chunk_assignments (
        file_uuid    TEXT NOT NULL,
        idx          INTEGER NOT NULL,
        peer_uuid    TEXT NOT NULL,
        assigned_at  TEXT NOT NULL,
        confirmed    INTEGER NOT NULL DEFAULT 0,
        last_seen_at TEXT NOT NULL,
        PRIMARY KEY (file_uuid, idx, peer_uuid)
    );

    CREATE TABLE replication_history (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        file_uuid TEXT NOT NULL,
        idx       INTEGER NOT NULL,
        from_peer TEXT NOT NULL,
        to_peer   TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        success   INTEGER NOT NULL
    );

    CREATE TABLE replication_tasks (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        file_uuid      TEXT NOT NULL,
        idx            INTEGER NOT NULL,
        lost_peer_uuid TEXT NOT NULL,
        created_at     TEXT NOT NULL,
        state          TEXT NOT NULL DEFAULT 'pending',
        attempts       INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE peers (
        peer_uuid     TEXT PRIMARY KEY,
        ip            TEXT NOT NULL,
        port          INTEGER NOT NULL,
        first_seen    TEXT NOT NULL,
        last_seen     TEXT NOT NULL,
        success_count INTEGER NOT NULL DEFAULT 1,
        failure_count INTEGER NOT NULL DEFAULT 1
    );
    ",
];

/// Embedded relational store for chunk metadata.
///
/// One writer at a time: every call takes the connection mutex and runs
/// inside a transaction, so a failed operation rolls back completely.
pub struct ChunkDb {
    conn: Mutex<Connection>,
}

impl ChunkDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = ChunkDb {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        info!("chunk database open at {}", path.display());
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = ChunkDb {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn migrate(&self) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
                [],
            )?;
            let version: i64 = tx
                .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
                .optional()?
                .unwrap_or(0);
            for (i, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
                debug!("applying schema migration {}", i + 1);
                tx.execute_batch(migration)?;
            }
            tx.execute("DELETE FROM schema_version", [])?;
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![MIGRATIONS.len() as i64],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // file_metadata
    // ------------------------------------------------------------------

    pub fn insert_file_metadata(&self, metadata: &FileMetadata) -> Result<()> {
        self.register_file(metadata, &[])
    }

    pub fn get_file_metadata(&self, file_uuid: &str) -> Result<Option<FileMetadata>> {
        let conn = self.conn();
        let metadata = conn
            .query_row(
                "SELECT * FROM file_metadata WHERE file_uuid = ?1",
                params![file_uuid],
                row_to_file_metadata,
            )
            .optional()?;
        Ok(metadata)
    }

    pub fn get_file_metadata_by_name(&self, owner_uuid: &str, name: &str) -> Result<Option<FileMetadata>> {
        let conn = self.conn();
        let metadata = conn
            .query_row(
                "SELECT * FROM file_metadata
                 WHERE owner_uuid = ?1 AND original_name = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![owner_uuid, name],
                row_to_file_metadata,
            )
            .optional()?;
        Ok(metadata)
    }

    pub fn list_files_by_owner(&self, owner_uuid: &str) -> Result<Vec<FileMetadata>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM file_metadata WHERE owner_uuid = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![owner_uuid], row_to_file_metadata)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn expired_files(&self, now: DateTime<Utc>) -> Result<Vec<FileMetadata>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM file_metadata WHERE expires_at <= ?1")?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_file_metadata)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_file_metadata(&self, file_uuid: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM file_metadata WHERE file_uuid = ?1",
                params![file_uuid],
            )?;
            Ok(())
        })
    }

    /// Insert a file's metadata and all of its chunk rows in one
    /// transaction, so a crash mid-registration leaves no half-recorded
    /// file behind.
    pub fn register_file(&self, metadata: &FileMetadata, chunks: &[StoredChunk]) -> Result<()> {
        let lrc_groups = serde_json::to_string(&metadata.lrc_groups)
            .map_err(|e| crate::Error::ChunkStorage(std::io::Error::other(e)))?;
        let chunk_hashes = serde_json::to_string(&metadata.chunk_hashes)
            .map_err(|e| crate::Error::ChunkStorage(std::io::Error::other(e)))?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO file_metadata (
                    file_uuid, owner_uuid, original_name, original_size, original_sha256,
                    k, m, chunk_size, total_chunks, lrc_group_size,
                    lrc_groups_blob, chunk_hashes_blob, created_at, expires_at,
                    content_hash, degraded
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    metadata.file_uuid,
                    metadata.owner_uuid,
                    metadata.original_name,
                    metadata.original_size as i64,
                    metadata.original_sha256,
                    metadata.k as i64,
                    metadata.m as i64,
                    metadata.chunk_size as i64,
                    metadata.total_chunks as i64,
                    metadata.lrc_group_size as i64,
                    lrc_groups,
                    chunk_hashes,
                    metadata.created_at.to_rfc3339(),
                    metadata.expires_at.to_rfc3339(),
                    metadata.content_hash,
                    metadata.degraded,
                ],
            )?;
            for chunk in chunks {
                tx.execute(
                    "INSERT OR REPLACE INTO chunks
                        (owner_uuid, file_uuid, idx, role, size_bytes, sha256, stored_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        chunk.owner_uuid,
                        chunk.file_uuid,
                        chunk.index as i64,
                        chunk.role.as_str(),
                        chunk.size_bytes as i64,
                        chunk.sha256,
                        chunk.stored_at.to_rfc3339(),
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Drop every trace of a file: metadata, chunk rows, locations,
    /// assignments and open replication tasks, atomically.
    pub fn remove_file(&self, file_uuid: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM file_metadata WHERE file_uuid = ?1", params![file_uuid])?;
            tx.execute("DELETE FROM chunks WHERE file_uuid = ?1", params![file_uuid])?;
            tx.execute("DELETE FROM chunk_locations WHERE file_uuid = ?1", params![file_uuid])?;
            tx.execute("DELETE FROM chunk_assignments WHERE file_uuid = ?1", params![file_uuid])?;
            tx.execute("DELETE FROM replication_tasks WHERE file_uuid = ?1", params![file_uuid])?;
            Ok(())
        })
    }

    pub fn set_file_degraded(&self, file_uuid: &str, degraded: bool) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE file_metadata SET degraded = ?2 WHERE file_uuid = ?1",
                params![file_uuid, degraded],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // chunks
    // ------------------------------------------------------------------

    pub fn insert_chunk(&self, chunk: &StoredChunk) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO chunks
                    (owner_uuid, file_uuid, idx, role, size_bytes, sha256, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chunk.owner_uuid,
                    chunk.file_uuid,
                    chunk.index as i64,
                    chunk.role.as_str(),
                    chunk.size_bytes as i64,
                    chunk.sha256,
                    chunk.stored_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_chunk_row(&self, owner_uuid: &str, file_uuid: &str, index: usize) -> Result<Option<StoredChunk>> {
        let conn = self.conn();
        let chunk = conn
            .query_row(
                "SELECT * FROM chunks WHERE owner_uuid = ?1 AND file_uuid = ?2 AND idx = ?3",
                params![owner_uuid, file_uuid, index as i64],
                row_to_stored_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    pub fn get_chunks_by_file(&self, file_uuid: &str) -> Result<Vec<StoredChunk>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM chunks WHERE file_uuid = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![file_uuid], row_to_stored_chunk)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_chunk_row(&self, owner_uuid: &str, file_uuid: &str, index: usize) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM chunks WHERE owner_uuid = ?1 AND file_uuid = ?2 AND idx = ?3",
                params![owner_uuid, file_uuid, index as i64],
            )?;
            Ok(())
        })
    }

    pub fn delete_chunks_by_file(&self, file_uuid: &str) -> Result<usize> {
        self.with_tx(|tx| {
            let deleted = tx.execute(
                "DELETE FROM chunks WHERE file_uuid = ?1",
                params![file_uuid],
            )?;
            Ok(deleted)
        })
    }

    // ------------------------------------------------------------------
    // chunk_locations and chunk_assignments
    // ------------------------------------------------------------------

    pub fn upsert_location(&self, location: &ChunkLocation) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO chunk_locations
                    (file_uuid, idx, peer_uuid, assigned_at, confirmed, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    location.file_uuid,
                    location.index as i64,
                    location.peer_uuid,
                    location.assigned_at.to_rfc3339(),
                    location.confirmed,
                    location.last_seen_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_locations(&self, file_uuid: &str, index: usize) -> Result<Vec<ChunkLocation>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM chunk_locations WHERE file_uuid = ?1 AND idx = ?2")?;
        let rows = stmt.query_map(params![file_uuid, index as i64], row_to_location)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_locations_by_file(&self, file_uuid: &str) -> Result<Vec<ChunkLocation>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM chunk_locations WHERE file_uuid = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![file_uuid], row_to_location)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_locations_by_peer(&self, peer_uuid: &str) -> Result<Vec<ChunkLocation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM chunk_locations WHERE peer_uuid = ?1")?;
        let rows = stmt.query_map(params![peer_uuid], row_to_location)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_location(&self, file_uuid: &str, index: usize, peer_uuid: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM chunk_locations WHERE file_uuid = ?1 AND idx = ?2 AND peer_uuid = ?3",
                params![file_uuid, index as i64, peer_uuid],
            )?;
            Ok(())
        })
    }

    pub fn delete_locations_by_file(&self, file_uuid: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM chunk_locations WHERE file_uuid = ?1",
                params![file_uuid],
            )?;
            tx.execute(
                "DELETE FROM chunk_assignments WHERE file_uuid = ?1",
                params![file_uuid],
            )?;
            Ok(())
        })
    }

    /// Record a not-yet-confirmed assignment. Moved to `chunk_locations`
    /// once the peer acknowledges the transfer.
    pub fn insert_assignment(&self, assignment: &ChunkLocation) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO chunk_assignments
                    (file_uuid, idx, peer_uuid, assigned_at, confirmed, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    assignment.file_uuid,
                    assignment.index as i64,
                    assignment.peer_uuid,
                    assignment.assigned_at.to_rfc3339(),
                    assignment.last_seen_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_assignment(&self, file_uuid: &str, index: usize, peer_uuid: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM chunk_assignments WHERE file_uuid = ?1 AND idx = ?2 AND peer_uuid = ?3",
                params![file_uuid, index as i64, peer_uuid],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // replication
    // ------------------------------------------------------------------

    /// Queue a relocation for a chunk whose holder was lost. No-op if an
    /// open task for the same chunk and peer already exists.
    pub fn create_replication_task(
        &self,
        file_uuid: &str,
        index: usize,
        lost_peer_uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_tx(|tx| {
            let open: i64 = tx.query_row(
                "SELECT COUNT(*) FROM replication_tasks
                 WHERE file_uuid = ?1 AND idx = ?2 AND lost_peer_uuid = ?3
                   AND state IN ('pending', 'in_progress')",
                params![file_uuid, index as i64, lost_peer_uuid],
                |row| row.get(0),
            )?;
            if open > 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO replication_tasks (file_uuid, idx, lost_peer_uuid, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![file_uuid, index as i64, lost_peer_uuid, now.to_rfc3339()],
            )?;
            Ok(true)
        })
    }

    pub fn pending_replication_tasks(&self) -> Result<Vec<ReplicationTask>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, file_uuid, idx, lost_peer_uuid, created_at, state, attempts
             FROM replication_tasks WHERE state = 'pending' ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn update_task_state(&self, task_id: i64, state: TaskState) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE replication_tasks SET state = ?2 WHERE id = ?1",
                params![task_id, state.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn bump_task_attempts(&self, task_id: i64) -> Result<u32> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE replication_tasks SET attempts = attempts + 1 WHERE id = ?1",
                params![task_id],
            )?;
            let attempts: i64 = tx.query_row(
                "SELECT attempts FROM replication_tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(attempts as u32)
        })
    }

    pub fn record_replication(
        &self,
        file_uuid: &str,
        index: usize,
        from_peer: &str,
        to_peer: &str,
        timestamp: DateTime<Utc>,
        success: bool,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO replication_history (file_uuid, idx, from_peer, to_peer, timestamp, success)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    file_uuid,
                    index as i64,
                    from_peer,
                    to_peer,
                    timestamp.to_rfc3339(),
                    success,
                ],
            )?;
            Ok(())
        })
    }

    /// `(from_peer, to_peer, success)` rows for one file, oldest first.
    pub fn replication_history_for(&self, file_uuid: &str) -> Result<Vec<(String, String, bool)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT from_peer, to_peer, success FROM replication_history
             WHERE file_uuid = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![file_uuid], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ------------------------------------------------------------------
    // peers
    // ------------------------------------------------------------------

    /// First observation inserts with both counters at 1 (Laplace prior);
    /// later observations refresh address and last-seen only.
    pub fn upsert_peer(&self, peer: &PeerAddr, now: DateTime<Utc>) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO peers (peer_uuid, ip, port, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(peer_uuid) DO UPDATE SET
                    ip = excluded.ip, port = excluded.port, last_seen = excluded.last_seen",
                params![peer.uuid, peer.ip, peer.port, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get_peer(&self, peer_uuid: &str) -> Result<Option<PeerInfo>> {
        let conn = self.conn();
        let peer = conn
            .query_row(
                "SELECT * FROM peers WHERE peer_uuid = ?1",
                params![peer_uuid],
                row_to_peer,
            )
            .optional()?;
        Ok(peer)
    }

    pub fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM peers")?;
        let rows = stmt.query_map([], row_to_peer)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn record_peer_success(&self, peer_uuid: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE peers SET success_count = success_count + 1, last_seen = ?2
                 WHERE peer_uuid = ?1",
                params![peer_uuid, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn record_peer_failure(&self, peer_uuid: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE peers SET failure_count = failure_count + 1 WHERE peer_uuid = ?1",
                params![peer_uuid],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // stats
    // ------------------------------------------------------------------

    /// Checkpoint the WAL so everything is durable in the main file.
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn get_local_stats(&self, self_uuid: &str) -> Result<LocalStats> {
        let conn = self.conn();
        let file_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |row| row.get(0))?;
        let local_chunk_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE owner_uuid = ?1",
            params![self_uuid],
            |row| row.get(0),
        )?;
        let foreign_chunk_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE owner_uuid != ?1",
            params![self_uuid],
            |row| row.get(0),
        )?;
        Ok(LocalStats {
            file_count: file_count as usize,
            local_chunk_count: local_chunk_count as usize,
            foreign_chunk_count: foreign_chunk_count as usize,
        })
    }
}

// ----------------------------------------------------------------------
// row mapping
// ----------------------------------------------------------------------

fn parse_ts(row_idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                row_idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(row_idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(row_idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_file_metadata(row: &Row<'_>) -> rusqlite::Result<FileMetadata> {
    Ok(FileMetadata {
        file_uuid: row.get("file_uuid")?,
        owner_uuid: row.get("owner_uuid")?,
        original_name: row.get("original_name")?,
        original_size: row.get::<_, i64>("original_size")? as u64,
        original_sha256: row.get("original_sha256")?,
        k: row.get::<_, i64>("k")? as usize,
        m: row.get::<_, i64>("m")? as usize,
        chunk_size: row.get::<_, i64>("chunk_size")? as usize,
        total_chunks: row.get::<_, i64>("total_chunks")? as usize,
        lrc_group_size: row.get::<_, i64>("lrc_group_size")? as usize,
        lrc_groups: parse_json(10, row.get("lrc_groups_blob")?)?,
        chunk_hashes: parse_json(11, row.get("chunk_hashes_blob")?)?,
        created_at: parse_ts(12, row.get("created_at")?)?,
        expires_at: parse_ts(13, row.get("expires_at")?)?,
        content_hash: row.get("content_hash")?,
        degraded: row.get("degraded")?,
    })
}

fn row_to_stored_chunk(row: &Row<'_>) -> rusqlite::Result<StoredChunk> {
    let role: String = row.get("role")?;
    Ok(StoredChunk {
        owner_uuid: row.get("owner_uuid")?,
        file_uuid: row.get("file_uuid")?,
        index: row.get::<_, i64>("idx")? as usize,
        role: role.parse::<ChunkRole>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        sha256: row.get("sha256")?,
        stored_at: parse_ts(6, row.get("stored_at")?)?,
    })
}

fn row_to_location(row: &Row<'_>) -> rusqlite::Result<ChunkLocation> {
    Ok(ChunkLocation {
        file_uuid: row.get("file_uuid")?,
        index: row.get::<_, i64>("idx")? as usize,
        peer_uuid: row.get("peer_uuid")?,
        assigned_at: parse_ts(3, row.get("assigned_at")?)?,
        confirmed: row.get("confirmed")?,
        last_seen_at: parse_ts(5, row.get("last_seen_at")?)?,
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ReplicationTask> {
    let state: String = row.get("state")?;
    Ok(ReplicationTask {
        id: row.get("id")?,
        file_uuid: row.get("file_uuid")?,
        index: row.get::<_, i64>("idx")? as usize,
        lost_peer_uuid: row.get("lost_peer_uuid")?,
        created_at: parse_ts(4, row.get("created_at")?)?,
        state: state.parse::<TaskState>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        attempts: row.get::<_, i64>("attempts")? as u32,
    })
}

fn row_to_peer(row: &Row<'_>) -> rusqlite::Result<PeerInfo> {
    Ok(PeerInfo {
        peer_uuid: row.get("peer_uuid")?,
        ip: row.get("ip")?,
        port: row.get::<_, i64>("port")? as u16,
        first_seen: parse_ts(3, row.get("first_seen")?)?,
        last_seen: parse_ts(4, row.get("last_seen")?)?,
        success_count: row.get::<_, i64>("success_count")? as u64,
        failure_count: row.get::<_, i64>("failure_count")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocalGroup;

    fn sample_metadata(file_uuid: &str, owner: &str, name: &str) -> FileMetadata {
        let now = Utc::now();
        FileMetadata {
            file_uuid: file_uuid.into(),
            owner_uuid: owner.into(),
            original_name: name.into(),
            original_size: 1000,
            original_sha256: "sha".into(),
            k: 6,
            m: 4,
            chunk_size: 167,
            total_chunks: 13,
            lrc_group_size: 2,
            lrc_groups: vec![LocalGroup {
                group_id: 0,
                chunk_indices: vec![0, 1],
                recovery_idx: 10,
            }],
            created_at: now,
            expires_at: now + chrono::Duration::days(30),
            content_hash: "sha".into(),
            chunk_hashes: vec!["h".into(); 13],
            degraded: false,
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = ChunkDb::open_in_memory().unwrap();
        // Running migrate twice must not re-apply anything.
        db.migrate().unwrap();
        assert_eq!(db.get_local_stats("me").unwrap().file_count, 0);
    }

    #[test]
    fn file_metadata_round_trip() {
        let db = ChunkDb::open_in_memory().unwrap();
        let metadata = sample_metadata("f1", "o1", "container.dat");
        db.insert_file_metadata(&metadata).unwrap();

        let loaded = db.get_file_metadata("f1").unwrap().unwrap();
        assert_eq!(loaded.owner_uuid, "o1");
        assert_eq!(loaded.lrc_groups, metadata.lrc_groups);
        assert_eq!(loaded.chunk_hashes.len(), 13);

        let by_name = db.get_file_metadata_by_name("o1", "container.dat").unwrap().unwrap();
        assert_eq!(by_name.file_uuid, "f1");
        assert!(db.get_file_metadata_by_name("o1", "nope").unwrap().is_none());

        db.delete_file_metadata("f1").unwrap();
        assert!(db.get_file_metadata("f1").unwrap().is_none());
    }

    #[test]
    fn expired_files_query() {
        let db = ChunkDb::open_in_memory().unwrap();
        let mut old = sample_metadata("old", "o1", "a");
        old.expires_at = Utc::now() - chrono::Duration::days(1);
        db.insert_file_metadata(&old).unwrap();
        db.insert_file_metadata(&sample_metadata("fresh", "o1", "b")).unwrap();

        let expired = db.expired_files(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].file_uuid, "old");
    }

    #[test]
    fn chunk_rows() {
        let db = ChunkDb::open_in_memory().unwrap();
        let chunk = StoredChunk {
            owner_uuid: "o1".into(),
            file_uuid: "f1".into(),
            index: 2,
            role: ChunkRole::Parity,
            size_bytes: 167,
            sha256: "abc".into(),
            stored_at: Utc::now(),
        };
        db.insert_chunk(&chunk).unwrap();

        let loaded = db.get_chunk_row("o1", "f1", 2).unwrap().unwrap();
        assert_eq!(loaded.role, ChunkRole::Parity);
        assert_eq!(db.get_chunks_by_file("f1").unwrap().len(), 1);

        db.delete_chunk_row("o1", "f1", 2).unwrap();
        assert!(db.get_chunk_row("o1", "f1", 2).unwrap().is_none());
    }

    #[test]
    fn locations_and_assignments() {
        let db = ChunkDb::open_in_memory().unwrap();
        let now = Utc::now();
        let location = ChunkLocation {
            file_uuid: "f1".into(),
            index: 0,
            peer_uuid: "p1".into(),
            assigned_at: now,
            confirmed: true,
            last_seen_at: now,
        };
        db.insert_assignment(&location).unwrap();
        db.upsert_location(&location).unwrap();
        db.delete_assignment("f1", 0, "p1").unwrap();

        assert_eq!(db.get_locations("f1", 0).unwrap().len(), 1);
        assert_eq!(db.get_locations_by_peer("p1").unwrap().len(), 1);
        assert_eq!(db.get_locations_by_file("f1").unwrap().len(), 1);

        db.delete_location("f1", 0, "p1").unwrap();
        assert!(db.get_locations("f1", 0).unwrap().is_empty());
    }

    #[test]
    fn replication_task_lifecycle() {
        let db = ChunkDb::open_in_memory().unwrap();
        let now = Utc::now();
        assert!(db.create_replication_task("f1", 0, "lost", now).unwrap());
        // Duplicate open task is rejected.
        assert!(!db.create_replication_task("f1", 0, "lost", now).unwrap());

        let tasks = db.pending_replication_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].state, TaskState::Pending);

        assert_eq!(db.bump_task_attempts(tasks[0].id).unwrap(), 1);
        db.update_task_state(tasks[0].id, TaskState::Done).unwrap();
        assert!(db.pending_replication_tasks().unwrap().is_empty());

        // A closed task no longer blocks a new one for the same chunk.
        assert!(db.create_replication_task("f1", 0, "lost", now).unwrap());
    }

    #[test]
    fn replication_history() {
        let db = ChunkDb::open_in_memory().unwrap();
        db.record_replication("f1", 0, "old", "new", Utc::now(), true).unwrap();
        let history = db.replication_history_for("f1").unwrap();
        assert_eq!(history, vec![("old".to_string(), "new".to_string(), true)]);
    }

    #[test]
    fn peer_counters_and_reliability() {
        let db = ChunkDb::open_in_memory().unwrap();
        let now = Utc::now();
        let addr = PeerAddr {
            uuid: "p1".into(),
            ip: "10.0.0.1".into(),
            port: 6000,
        };
        db.upsert_peer(&addr, now).unwrap();

        let peer = db.get_peer("p1").unwrap().unwrap();
        assert_eq!(peer.success_count, 1);
        assert_eq!(peer.failure_count, 1);
        assert_eq!(peer.reliability(), 0.5);

        // A success never decreases reliability, a failure never increases it.
        db.record_peer_success("p1", now).unwrap();
        let after_success = db.get_peer("p1").unwrap().unwrap().reliability();
        assert!(after_success >= 0.5);

        db.record_peer_failure("p1").unwrap();
        let after_failure = db.get_peer("p1").unwrap().unwrap().reliability();
        assert!(after_failure <= after_success);

        // Re-announce refreshes address without resetting counters.
        let moved = PeerAddr {
            uuid: "p1".into(),
            ip: "10.0.0.2".into(),
            port: 6001,
        };
        db.upsert_peer(&moved, now).unwrap();
        let peer = db.get_peer("p1").unwrap().unwrap();
        assert_eq!(peer.ip, "10.0.0.2");
        assert_eq!(peer.success_count, 2);
    }

    #[test]
    fn local_stats_split_by_owner() {
        let db = ChunkDb::open_in_memory().unwrap();
        db.insert_file_metadata(&sample_metadata("f1", "me", "a")).unwrap();
        for (owner, file, idx) in [("me", "f1", 0), ("me", "f1", 1), ("them", "f2", 0)] {
            db.insert_chunk(&StoredChunk {
                owner_uuid: owner.into(),
                file_uuid: file.into(),
                index: idx,
                role: ChunkRole::Data,
                size_bytes: 1,
                sha256: "s".into(),
                stored_at: Utc::now(),
            })
            .unwrap();
        }
        let stats = db.get_local_stats("me").unwrap();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.local_chunk_count, 2);
        assert_eq!(stats.foreign_chunk_count, 1);
    }
}
