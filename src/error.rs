use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the vault core.
///
/// Policies per kind:
/// - codec errors are fatal to the current operation and surfaced,
/// - peer communication errors are retried (3 tries, exponential backoff)
///   before being surfaced or recorded,
/// - database errors roll back the enclosing transaction,
/// - a wrong passphrase is surfaced immediately and never retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("chunk encoding failed: {0}")]
    ChunkEncoding(String),

    #[error("chunk decoding failed: {0}")]
    ChunkDecoding(String),

    #[error("insufficient chunks: {available} available, {required} required")]
    InsufficientChunks { available: usize, required: usize },

    #[error("chunk not found: {owner_uuid}/{file_uuid}#{index}")]
    ChunkNotFound {
        owner_uuid: String,
        file_uuid: String,
        index: usize,
    },

    #[error("chunk {file_uuid}#{index} failed validation: expected sha256 {expected}, got {actual}")]
    ChunkValidation {
        file_uuid: String,
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("chunk storage error: {0}")]
    ChunkStorage(#[from] std::io::Error),

    #[error("file metadata not found: {0}")]
    FileMetadataNotFound(String),

    #[error("chunk database error: {0}")]
    ChunkDatabase(#[from] rusqlite::Error),

    #[error("peer {peer_uuid}: {reason}")]
    PeerCommunication { peer_uuid: String, reason: String },

    #[error("replication failed: {0}")]
    Replication(String),

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("decryption failed: invalid key or ciphertext")]
    InvalidKeyOrCipher,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no peers available")]
    NoPeersAvailable,
}

impl Error {
    /// Process exit code for errors that bubble all the way up to `main`.
    /// User errors exit 1, internal failures exit 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) | Error::WrongPassphrase => 1,
            _ => 2,
        }
    }

    pub fn peer(peer_uuid: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PeerCommunication {
            peer_uuid: peer_uuid.into(),
            reason: reason.into(),
        }
    }
}
