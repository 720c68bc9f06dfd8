pub mod clock;
pub mod codec;
pub mod commands;
pub mod config;
pub mod container;
pub mod cryptography;
pub mod db;
pub mod error;
pub mod keystore;
pub mod manager;
pub mod models;
pub mod replication;
pub mod rpc;
pub mod server;
pub mod store;
pub mod tracker;

pub use error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Known plaintext sealed into the retention file, used to verify a passphrase
/// without ever storing the passphrase itself.
pub const VERIFICATION_PLAINTEXT: &[u8] = b"decentralis-verification";

/// Name under which the encrypted container is chunked and tracked.
pub const CONTAINER_NAME: &str = "container.dat";
