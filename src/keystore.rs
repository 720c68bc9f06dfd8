use std::path::Path;

use log::{debug, info};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::cryptography::{self, CipherAlgorithm};
use crate::error::{Error, Result};
use crate::{KEY_SIZE, VERIFICATION_PLAINTEXT};

pub const DEFAULT_ITERATIONS: u32 = 200_000;
pub const MIN_ITERATIONS: u32 = 100_000;

/// On-disk retention record (`data/key.json`).
///
/// Stores everything needed to re-derive and verify the container key from
/// a passphrase: KDF parameters plus a small verification blob. The
/// passphrase itself is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRecord {
    pub version: u32,
    pub kdf: String,
    /// 16-byte salt, hex encoded.
    pub salt: String,
    pub iterations: u32,
    pub algorithm: CipherAlgorithm,
    /// `nonce || ciphertext` of the verification plaintext, hex encoded.
    pub verify: String,
}

/// PBKDF2-HMAC-SHA256 with a 32-byte output.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<[u8; KEY_SIZE]> {
    if iterations < MIN_ITERATIONS {
        return Err(Error::Configuration(format!(
            "PBKDF2 iteration count {iterations} below the minimum of {MIN_ITERATIONS}"
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
    Ok(key)
}

/// Create a fresh retention record at `path`.
///
/// Generates a random 16-byte salt, derives the key, and seals the
/// verification plaintext with the chosen AEAD so the passphrase can be
/// checked later. The write is atomic (`.tmp` then rename).
pub fn generate_retention(
    path: &Path,
    passphrase: &str,
    iterations: u32,
    algorithm: CipherAlgorithm,
) -> Result<()> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let key = derive_key(passphrase, &salt, iterations)?;
    let verify = cryptography::encrypt(&key, VERIFICATION_PLAINTEXT, algorithm)?;

    let record = RetentionRecord {
        version: 1,
        kdf: "pbkdf2".to_string(),
        salt: hex::encode(salt),
        iterations,
        algorithm,
        verify: hex::encode(verify),
    };

    let json = serde_json::to_string_pretty(&record)
        .map_err(|e| Error::Configuration(format!("cannot serialize retention record: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    info!("retention record written to {}", path.display());
    Ok(())
}

pub fn load_retention(path: &Path) -> Result<RetentionRecord> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map_err(|e| Error::Configuration(format!("invalid retention record: {e}")))
}

/// Re-derive the key from `passphrase` and check it against the record's
/// verification blob. Returns the key as hex on success; the record on disk
/// is never modified.
pub fn verify_passphrase(path: &Path, passphrase: &str) -> Result<String> {
    let record = load_retention(path)?;
    let salt = hex::decode(&record.salt)
        .map_err(|e| Error::Configuration(format!("invalid salt in retention record: {e}")))?;
    let blob = hex::decode(&record.verify)
        .map_err(|e| Error::Configuration(format!("invalid verify blob in retention record: {e}")))?;

    let key = derive_key(passphrase, &salt, record.iterations)?;
    let plaintext =
        cryptography::decrypt(&key, &blob, record.algorithm).map_err(|_| Error::WrongPassphrase)?;
    if plaintext != VERIFICATION_PLAINTEXT {
        return Err(Error::WrongPassphrase);
    }
    debug!("passphrase verified against {}", path.display());
    Ok(hex::encode(key))
}

/// Holds the derived key for the lifetime of the process.
///
/// The key only ever lives here; `clear` overwrites it before dropping so
/// shutdown leaves no copy behind.
#[derive(Default)]
pub struct PassphraseCache {
    key: Option<[u8; KEY_SIZE]>,
}

impl PassphraseCache {
    pub fn new() -> Self {
        PassphraseCache { key: None }
    }

    pub fn set(&mut self, key: [u8; KEY_SIZE]) {
        self.key = Some(key);
    }

    pub fn key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.key.as_ref()
    }

    pub fn clear(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.fill(0);
        }
        self.key = None;
    }
}

impl Drop for PassphraseCache {
    fn drop(&mut self) {
        self.clear();
    }
}
