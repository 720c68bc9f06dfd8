use std::fmt;
use std::path::Path;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{KEY_SIZE, NONCE_SIZE};

/// AEAD algorithm used to protect the container before chunking.
///
/// Both take a 32-byte key and a 12-byte nonce; the wire names match the
/// retention record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "AES-256")]
    Aes256Gcm,
    #[serde(rename = "ChaCha20")]
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "AES-256",
            CipherAlgorithm::ChaCha20Poly1305 => "ChaCha20",
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AES-256" => Ok(CipherAlgorithm::Aes256Gcm),
            "ChaCha20" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            other => Err(Error::Configuration(format!("unsupported cipher: {other}"))),
        }
    }
}

/// Encrypt a buffer with a fresh random nonce.
///
/// Output layout: `nonce (12 bytes) || ciphertext + 16-byte tag`. The tag
/// makes any tampering detectable at decryption time.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    plaintext: &[u8],
    algorithm: CipherAlgorithm,
) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = match algorithm {
        CipherAlgorithm::Aes256Gcm => Aes256Gcm::new(key.into())
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::InvalidKeyOrCipher)?,
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.into())
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::InvalidKeyOrCipher)?,
    };

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext` blob produced by [`encrypt`].
///
/// Fails with `InvalidKeyOrCipher` on a bad key, wrong algorithm or any
/// modification of the ciphertext; partial plaintext is never returned.
pub fn decrypt(key: &[u8; KEY_SIZE], blob: &[u8], algorithm: CipherAlgorithm) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE {
        return Err(Error::InvalidKeyOrCipher);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    match algorithm {
        CipherAlgorithm::Aes256Gcm => Aes256Gcm::new(key.into())
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::InvalidKeyOrCipher),
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.into())
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::InvalidKeyOrCipher),
    }
}

/// Encrypt a whole file to `out_path`. The container is small enough to fit
/// in memory (its contents are base64 blobs inside a JSON object), so no
/// streaming variant exists.
pub fn encrypt_file(
    in_path: &Path,
    out_path: &Path,
    key: &[u8; KEY_SIZE],
    algorithm: CipherAlgorithm,
) -> Result<()> {
    let data = std::fs::read(in_path)?;
    let blob = encrypt(key, &data, algorithm)?;
    std::fs::write(out_path, blob)?;
    Ok(())
}

/// Decrypt a file previously written by [`encrypt_file`].
pub fn decrypt_file(
    in_path: &Path,
    out_path: &Path,
    key: &[u8; KEY_SIZE],
    algorithm: CipherAlgorithm,
) -> Result<()> {
    let blob = std::fs::read(in_path)?;
    let plaintext = decrypt(key, &blob, algorithm)?;
    std::fs::write(out_path, plaintext)?;
    Ok(())
}

/// Parse a 64-character hex key into raw bytes.
pub fn parse_key_hex(key_hex: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = hex::decode(key_hex).map_err(|_| Error::InvalidKeyOrCipher)?;
    bytes.try_into().map_err(|_| Error::InvalidKeyOrCipher)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALGORITHMS: [CipherAlgorithm; 2] =
        [CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305];

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        for algorithm in ALGORITHMS {
            let key = [7u8; KEY_SIZE];
            let plaintext = b"Hello, World! This is a test message.";

            let blob = encrypt(&key, plaintext, algorithm).expect("encryption should succeed");
            // nonce + ciphertext + tag
            assert_eq!(blob.len(), NONCE_SIZE + plaintext.len() + 16);

            let decrypted = decrypt(&key, &blob, algorithm).expect("decryption should succeed");
            assert_eq!(&decrypted[..], plaintext);
        }
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        for algorithm in ALGORITHMS {
            let blob = encrypt(&[0u8; KEY_SIZE], b"secret", algorithm).unwrap();
            let result = decrypt(&[1u8; KEY_SIZE], &blob, algorithm);
            assert!(matches!(result, Err(Error::InvalidKeyOrCipher)));
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        for algorithm in ALGORITHMS {
            let key = [3u8; KEY_SIZE];
            let mut blob = encrypt(&key, b"important data", algorithm).unwrap();
            // Flip one byte past the nonce.
            blob[NONCE_SIZE + 2] ^= 0xff;
            assert!(matches!(
                decrypt(&key, &blob, algorithm),
                Err(Error::InvalidKeyOrCipher)
            ));
        }
    }

    #[test]
    fn test_tampered_auth_tag_fails() {
        let key = [9u8; KEY_SIZE];
        let mut blob = encrypt(&key, b"authenticated", CipherAlgorithm::Aes256Gcm).unwrap();
        let len = blob.len();
        blob[len - 1] ^= 0x01;
        assert!(decrypt(&key, &blob, CipherAlgorithm::Aes256Gcm).is_err());
    }

    #[test]
    fn test_encrypt_empty_data() {
        let key = [42u8; KEY_SIZE];
        let blob = encrypt(&key, b"", CipherAlgorithm::ChaCha20Poly1305).unwrap();
        assert_eq!(blob.len(), NONCE_SIZE + 16);
        let decrypted = decrypt(&key, &blob, CipherAlgorithm::ChaCha20Poly1305).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_truncated_blob_fails() {
        let key = [5u8; KEY_SIZE];
        let blob = encrypt(&key, b"data to truncate", CipherAlgorithm::Aes256Gcm).unwrap();
        assert!(decrypt(&key, &blob[..blob.len() - 5], CipherAlgorithm::Aes256Gcm).is_err());
        // Shorter than a nonce is rejected outright.
        assert!(decrypt(&key, &blob[..8], CipherAlgorithm::Aes256Gcm).is_err());
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let key = [77u8; KEY_SIZE];
        let plaintext = b"same plaintext";
        let a = encrypt(&key, plaintext, CipherAlgorithm::Aes256Gcm).unwrap();
        let b = encrypt(&key, plaintext, CipherAlgorithm::Aes256Gcm).unwrap();
        // Random nonces make repeated encryptions distinct.
        assert_ne!(a, b);
    }

    #[test]
    fn test_algorithm_mismatch_fails() {
        let key = [11u8; KEY_SIZE];
        let blob = encrypt(&key, b"cross-cipher", CipherAlgorithm::Aes256Gcm).unwrap();
        assert!(decrypt(&key, &blob, CipherAlgorithm::ChaCha20Poly1305).is_err());
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in ALGORITHMS {
            assert_eq!(algorithm.as_str().parse::<CipherAlgorithm>().unwrap(), algorithm);
        }
        assert!("DES".parse::<CipherAlgorithm>().is_err());
    }

    #[test]
    fn test_file_encrypt_decrypt_roundtrip() {
        let dir = std::env::temp_dir().join(format!("decentralis_cipher_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let plain = dir.join("plain.bin");
        let sealed = dir.join("sealed.bin");
        let recovered = dir.join("recovered.bin");

        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&plain, &data).unwrap();
        let key = [21u8; KEY_SIZE];

        encrypt_file(&plain, &sealed, &key, CipherAlgorithm::ChaCha20Poly1305).unwrap();
        // nonce || ciphertext layout on disk
        assert_eq!(
            std::fs::read(&sealed).unwrap().len(),
            NONCE_SIZE + data.len() + 16
        );

        decrypt_file(&sealed, &recovered, &key, CipherAlgorithm::ChaCha20Poly1305).unwrap();
        assert_eq!(std::fs::read(&recovered).unwrap(), data);
    }

    #[test]
    fn test_parse_key_hex() {
        let key = parse_key_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xab; KEY_SIZE]);
        assert!(parse_key_hex("deadbeef").is_err());
        assert!(parse_key_hex("zz").is_err());
    }
}
