use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::models::{sha256_hex, FileMetadata};

/// On-disk chunk storage.
///
/// Layout under the storage root:
///
/// ```text
/// chunks/
/// ├── <owner_uuid>/
/// │   ├── <file_uuid>/
/// │   │   ├── metadata.json
/// │   │   ├── 0.chunk
/// │   │   └── 1.chunk
/// │   └── <file_uuid2>/
/// └── <owner_uuid2>/
/// ```
///
/// All writes go through a `.tmp` file and a rename, so concurrent readers
/// never observe a half-written chunk.
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("chunk store at {}", root.display());
        Ok(ChunkStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_dir(&self, owner_uuid: &str, file_uuid: &str) -> PathBuf {
        self.root.join(owner_uuid).join(file_uuid)
    }

    pub fn chunk_path(&self, owner_uuid: &str, file_uuid: &str, index: usize) -> PathBuf {
        self.file_dir(owner_uuid, file_uuid).join(format!("{index}.chunk"))
    }

    fn metadata_path(&self, owner_uuid: &str, file_uuid: &str) -> PathBuf {
        self.file_dir(owner_uuid, file_uuid).join("metadata.json")
    }

    /// Persist one chunk atomically, returning its final path.
    pub fn store_chunk(
        &self,
        owner_uuid: &str,
        file_uuid: &str,
        index: usize,
        data: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.file_dir(owner_uuid, file_uuid);
        fs::create_dir_all(&dir)?;

        let path = self.chunk_path(owner_uuid, file_uuid, index);
        let tmp = dir.join(format!("{index}.chunk.tmp"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        debug!(
            "stored chunk {owner_uuid}/{file_uuid}#{index} ({} bytes)",
            data.len()
        );
        Ok(path)
    }

    /// Persist the file's `metadata.json` atomically.
    pub fn store_metadata(&self, metadata: &FileMetadata) -> Result<PathBuf> {
        let dir = self.file_dir(&metadata.owner_uuid, &metadata.file_uuid);
        fs::create_dir_all(&dir)?;

        let path = self.metadata_path(&metadata.owner_uuid, &metadata.file_uuid);
        let json = serde_json::to_string_pretty(metadata)
            .map_err(|e| Error::ChunkStorage(std::io::Error::other(e)))?;
        let tmp = dir.join("metadata.json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn load_metadata(&self, owner_uuid: &str, file_uuid: &str) -> Result<Option<FileMetadata>> {
        let path = self.metadata_path(owner_uuid, file_uuid);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let metadata = serde_json::from_str(&json)
            .map_err(|e| Error::ChunkStorage(std::io::Error::other(e)))?;
        Ok(Some(metadata))
    }

    pub fn get_chunk(&self, owner_uuid: &str, file_uuid: &str, index: usize) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(owner_uuid, file_uuid, index);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }

    pub fn has_chunk(&self, owner_uuid: &str, file_uuid: &str, index: usize) -> bool {
        self.chunk_path(owner_uuid, file_uuid, index).exists()
    }

    /// Sorted chunk indices present on disk for one file.
    pub fn list_chunks(&self, owner_uuid: &str, file_uuid: &str) -> Result<Vec<usize>> {
        let dir = self.file_dir(owner_uuid, file_uuid);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut indices = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".chunk") {
                if let Ok(index) = stem.parse() {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// File UUIDs stored for one owner.
    pub fn list_files(&self, owner_uuid: &str) -> Result<Vec<String>> {
        let dir = self.root.join(owner_uuid);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(files)
    }

    /// Delete one chunk. Returns whether anything was removed.
    pub fn delete_chunk(&self, owner_uuid: &str, file_uuid: &str, index: usize) -> Result<bool> {
        let path = self.chunk_path(owner_uuid, file_uuid, index);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        debug!("deleted chunk {owner_uuid}/{file_uuid}#{index}");
        Ok(true)
    }

    /// Remove a file's entire directory (chunks + metadata). Returns the
    /// number of entries removed. Either the whole subtree goes or the error
    /// is surfaced with the subtree intact enough to retry.
    pub fn delete_file_chunks(&self, owner_uuid: &str, file_uuid: &str) -> Result<usize> {
        let dir = self.file_dir(owner_uuid, file_uuid);
        if !dir.exists() {
            return Ok(0);
        }
        let count = fs::read_dir(&dir)?.count();
        fs::remove_dir_all(&dir)?;
        info!("removed {count} stored files for {owner_uuid}/{file_uuid}");
        Ok(count)
    }

    /// Re-read a chunk and compare its SHA-256 against `expected`.
    ///
    /// A missing chunk is `ChunkNotFound`; a corrupt one is
    /// `ChunkValidation` and should be treated as lost by the caller.
    pub fn validate_chunk(
        &self,
        owner_uuid: &str,
        file_uuid: &str,
        index: usize,
        expected: &str,
    ) -> Result<()> {
        let data = self.get_chunk(owner_uuid, file_uuid, index)?.ok_or_else(|| {
            Error::ChunkNotFound {
                owner_uuid: owner_uuid.to_string(),
                file_uuid: file_uuid.to_string(),
                index,
            }
        })?;
        let actual = sha256_hex(&data);
        if actual != expected {
            error!("chunk {file_uuid}#{index} is corrupt on disk");
            return Err(Error::ChunkValidation {
                file_uuid: file_uuid.to_string(),
                index,
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Drop leftover `.tmp` files from interrupted or cancelled writes.
    pub fn remove_stale_tmp(&self, owner_uuid: &str, file_uuid: &str) -> Result<()> {
        let dir = self.file_dir(owner_uuid, file_uuid);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "tmp") {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch_store(name: &str) -> ChunkStore {
        let dir = std::env::temp_dir()
            .join(format!("decentralis_store_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        ChunkStore::new(dir).unwrap()
    }

    fn sample_metadata() -> FileMetadata {
        FileMetadata {
            file_uuid: "file-1".into(),
            owner_uuid: "owner-1".into(),
            original_name: "test.dat".into(),
            original_size: 100,
            original_sha256: "h".into(),
            k: 2,
            m: 1,
            chunk_size: 50,
            total_chunks: 4,
            lrc_group_size: 2,
            lrc_groups: vec![],
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            content_hash: "h".into(),
            chunk_hashes: vec![String::new(); 4],
            degraded: false,
        }
    }

    #[test]
    fn store_and_read_chunk() {
        let store = scratch_store("rw");
        store.store_chunk("owner-1", "file-1", 0, b"chunk data").unwrap();

        assert_eq!(store.get_chunk("owner-1", "file-1", 0).unwrap().unwrap(), b"chunk data");
        assert!(store.get_chunk("owner-1", "file-1", 99).unwrap().is_none());
        assert!(store.has_chunk("owner-1", "file-1", 0));
        // No .tmp left behind after the rename.
        assert!(!store.file_dir("owner-1", "file-1").join("0.chunk.tmp").exists());
    }

    #[test]
    fn list_chunks_is_sorted() {
        let store = scratch_store("list");
        for index in [5usize, 0, 2] {
            store.store_chunk("o", "f", index, b"x").unwrap();
        }
        assert_eq!(store.list_chunks("o", "f").unwrap(), vec![0, 2, 5]);
        assert!(store.list_chunks("o", "missing").unwrap().is_empty());
    }

    #[test]
    fn metadata_round_trip() {
        let store = scratch_store("meta");
        let metadata = sample_metadata();
        store.store_metadata(&metadata).unwrap();

        let loaded = store.load_metadata("owner-1", "file-1").unwrap().unwrap();
        assert_eq!(loaded.file_uuid, metadata.file_uuid);
        assert_eq!(loaded.total_chunks, 4);
        assert!(store.load_metadata("owner-1", "other").unwrap().is_none());
    }

    #[test]
    fn delete_file_chunks_removes_subtree() {
        let store = scratch_store("delete");
        store.store_chunk("o", "f", 0, b"a").unwrap();
        store.store_chunk("o", "f", 1, b"b").unwrap();

        let removed = store.delete_file_chunks("o", "f").unwrap();
        assert_eq!(removed, 2);
        assert!(!store.file_dir("o", "f").exists());
        // Idempotent on a missing directory.
        assert_eq!(store.delete_file_chunks("o", "f").unwrap(), 0);
    }

    #[test]
    fn delete_chunk_is_idempotent() {
        let store = scratch_store("del_chunk");
        store.store_chunk("o", "f", 3, b"abc").unwrap();
        assert!(store.delete_chunk("o", "f", 3).unwrap());
        assert!(!store.delete_chunk("o", "f", 3).unwrap());
    }

    #[test]
    fn validate_chunk_detects_corruption() {
        let store = scratch_store("validate");
        let data = b"valid chunk".to_vec();
        store.store_chunk("o", "f", 0, &data).unwrap();

        store.validate_chunk("o", "f", 0, &sha256_hex(&data)).unwrap();

        // Corrupt the file behind the store's back.
        fs::write(store.chunk_path("o", "f", 0), b"corrupted!").unwrap();
        let err = store.validate_chunk("o", "f", 0, &sha256_hex(&data)).unwrap_err();
        assert!(matches!(err, Error::ChunkValidation { index: 0, .. }));

        let err = store.validate_chunk("o", "f", 7, "whatever").unwrap_err();
        assert!(matches!(err, Error::ChunkNotFound { index: 7, .. }));
    }

    #[test]
    fn stale_tmp_files_are_swept() {
        let store = scratch_store("tmp");
        store.store_chunk("o", "f", 0, b"x").unwrap();
        fs::write(store.file_dir("o", "f").join("1.chunk.tmp"), b"partial").unwrap();

        store.remove_stale_tmp("o", "f").unwrap();
        assert!(!store.file_dir("o", "f").join("1.chunk.tmp").exists());
        assert!(store.has_chunk("o", "f", 0));
    }
}
