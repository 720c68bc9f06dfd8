use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cryptography::{self, CipherAlgorithm};
use crate::error::{Error, Result};
use crate::rpc::{b64_decode, b64_encode};
use crate::KEY_SIZE;

/// One entry in the container, indexed by virtual path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir,
    File(Vec<u8>),
}

/// The user's primary data object: a virtual file tree serialized as JSON,
/// encrypted as a whole, then chunked and replicated like any other file.
///
/// Wire format (what the file browser reads and writes):
/// `{"entries": {"<path>": {"type": "dir"} | {"type": "file", "content": "<base64>"}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    entries: BTreeMap<String, Entry>,
}

#[derive(Serialize, Deserialize)]
struct WireContainer {
    entries: BTreeMap<String, WireEntry>,
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl Container {
    pub fn new() -> Self {
        Container::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert_dir(&mut self, path: impl Into<String>) {
        self.entries.insert(path.into(), Entry::Dir);
    }

    pub fn insert_file(&mut self, path: impl Into<String>, content: Vec<u8>) {
        self.entries.insert(path.into(), Entry::File(content));
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let wire = WireContainer {
            entries: self
                .entries
                .iter()
                .map(|(path, entry)| {
                    let wire_entry = match entry {
                        Entry::Dir => WireEntry {
                            kind: "dir".to_string(),
                            content: None,
                        },
                        Entry::File(bytes) => WireEntry {
                            kind: "file".to_string(),
                            content: Some(b64_encode(bytes)),
                        },
                    };
                    (path.clone(), wire_entry)
                })
                .collect(),
        };
        serde_json::to_vec(&wire).map_err(|e| Error::ChunkStorage(std::io::Error::other(e)))
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let wire: WireContainer = serde_json::from_slice(raw)
            .map_err(|e| Error::Configuration(format!("invalid container format: {e}")))?;
        let mut entries = BTreeMap::new();
        for (path, wire_entry) in wire.entries {
            let entry = match wire_entry.kind.as_str() {
                "dir" => Entry::Dir,
                "file" => {
                    let content = wire_entry.content.unwrap_or_default();
                    Entry::File(b64_decode(&content).map_err(|_| {
                        Error::Configuration(format!("invalid base64 content for {path}"))
                    })?)
                }
                other => {
                    return Err(Error::Configuration(format!(
                        "unknown container entry type: {other}"
                    )))
                }
            };
            entries.insert(path, entry);
        }
        Ok(Container { entries })
    }

    /// Encrypt and write the container to `path` (`nonce || ciphertext`).
    pub fn save_encrypted(
        &self,
        path: &Path,
        key: &[u8; KEY_SIZE],
        algorithm: CipherAlgorithm,
    ) -> Result<Vec<u8>> {
        let plaintext = self.to_json()?;
        let blob = cryptography::encrypt(key, &plaintext, algorithm)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("dat.tmp");
        std::fs::write(&tmp, &blob)?;
        std::fs::rename(&tmp, path)?;
        Ok(blob)
    }

    /// Read and decrypt a container written by [`Container::save_encrypted`].
    pub fn load_encrypted(
        path: &Path,
        key: &[u8; KEY_SIZE],
        algorithm: CipherAlgorithm,
    ) -> Result<Self> {
        let blob = std::fs::read(path)?;
        let plaintext = cryptography::decrypt(key, &blob, algorithm)?;
        Container::from_json(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Container {
        let mut container = Container::new();
        container.insert_dir("documents");
        container.insert_file("documents/note.txt", b"hello vault".to_vec());
        container.insert_file("photo.jpg", vec![0xff, 0xd8, 0x00, 0x42]);
        container
    }

    #[test]
    fn json_round_trip() {
        let container = sample();
        let json = container.to_json().unwrap();
        let back = Container::from_json(&json).unwrap();
        assert_eq!(back, container);
        assert_eq!(back.len(), 3);
        assert_eq!(
            back.get("documents/note.txt"),
            Some(&Entry::File(b"hello vault".to_vec()))
        );
        assert_eq!(back.get("documents"), Some(&Entry::Dir));
    }

    #[test]
    fn wire_format_shape() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["entries"]["documents"]["type"], "dir");
        assert_eq!(value["entries"]["photo.jpg"]["type"], "file");
        // Dir entries carry no content field.
        assert!(value["entries"]["documents"].get("content").is_none());
    }

    #[test]
    fn unknown_entry_type_rejected() {
        let raw = br#"{"entries": {"x": {"type": "symlink"}}}"#;
        assert!(matches!(
            Container::from_json(raw),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn encrypted_save_and_load() {
        let dir = std::env::temp_dir().join(format!("decentralis_container_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("container.dat");

        let container = sample();
        let key = [6u8; KEY_SIZE];
        container
            .save_encrypted(&path, &key, CipherAlgorithm::Aes256Gcm)
            .unwrap();

        let loaded = Container::load_encrypted(&path, &key, CipherAlgorithm::Aes256Gcm).unwrap();
        assert_eq!(loaded, container);

        // Wrong key cannot open it.
        assert!(matches!(
            Container::load_encrypted(&path, &[9u8; KEY_SIZE], CipherAlgorithm::Aes256Gcm),
            Err(Error::InvalidKeyOrCipher)
        ));
    }
}
