use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};

pub const DEFAULT_TRACKER_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_LISTEN_PORT: u16 = 6000;

const MIB: usize = 1024 * 1024;

/// Runtime configuration, resolved once at startup from environment
/// variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all on-disk state (`data/` next to the executable by default).
    pub data_dir: PathBuf,
    /// Reed-Solomon data shard count.
    pub rs_k: usize,
    /// Reed-Solomon parity shard count.
    pub rs_m: usize,
    /// Size of each data chunk in bytes. The last data chunk is zero-padded
    /// to this size.
    pub chunk_size: usize,
    /// Number of data chunks per LRC local group.
    pub lrc_group_size: usize,
    /// Retention window for chunked files.
    pub retention_days: i64,
    /// Minimum reliability score for a peer to receive chunks.
    pub min_reliability: f64,
    /// Client-side deadline for a single RPC.
    pub rpc_timeout: Duration,
    /// Retries for a failed chunk transfer.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_delay: Duration,
    /// Tracker re-announce period.
    pub keepalive_interval: Duration,
    /// A peer absent from the tracker list for this many keepalive intervals
    /// is declared lost.
    pub peer_loss_threshold: u32,
    pub replication_sweep_interval: Duration,
    pub expiry_sweep_interval: Duration,
    /// Tracker endpoint, `ip:port`.
    pub tracker_addr: String,
    /// IP we announce to the tracker.
    pub announce_ip: String,
    /// Port our RPC server listens on.
    pub listen_port: u16,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("data"),
            rs_k: 6,
            rs_m: 4,
            chunk_size: 10 * MIB,
            lrc_group_size: 2,
            retention_days: 30,
            min_reliability: 0.5,
            rpc_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(15),
            peer_loss_threshold: 3,
            replication_sweep_interval: Duration::from_secs(60),
            expiry_sweep_interval: Duration::from_secs(3600),
            tracker_addr: DEFAULT_TRACKER_ADDR.to_string(),
            announce_ip: "127.0.0.1".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            debug: false,
        }
    }
}

impl Config {
    /// Builds the configuration from `DECENTRALIS_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        let config = Config {
            data_dir: env::var("DECENTRALIS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            rs_k: env_usize("DECENTRALIS_RS_K", defaults.rs_k),
            rs_m: env_usize("DECENTRALIS_RS_M", defaults.rs_m),
            chunk_size: env_usize("DECENTRALIS_CHUNK_SIZE_MB", 10) * MIB,
            lrc_group_size: env_usize("DECENTRALIS_LRC_GROUP_SIZE", defaults.lrc_group_size),
            retention_days: env_usize("DECENTRALIS_RETENTION_DAYS", 30) as i64,
            tracker_addr: env::var("DECENTRALIS_TRACKER").unwrap_or(defaults.tracker_addr),
            announce_ip: env::var("DECENTRALIS_ANNOUNCE_IP").unwrap_or(defaults.announce_ip),
            listen_port: env_usize("DECENTRALIS_LISTEN_PORT", DEFAULT_LISTEN_PORT as usize) as u16,
            debug: env::var("DECENTRALIS_DEBUG").map(|v| v != "0").unwrap_or(false),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects parameter combinations the codec cannot represent.
    pub fn validate(&self) -> Result<()> {
        if self.rs_k < 1 {
            return Err(Error::Configuration(format!(
                "RS K must be at least 1, got {}",
                self.rs_k
            )));
        }
        if self.rs_k + self.rs_m > 255 {
            return Err(Error::Configuration(format!(
                "K + M = {} exceeds the Reed-Solomon GF(2^8) limit of 255",
                self.rs_k + self.rs_m
            )));
        }
        if self.lrc_group_size < 1 {
            return Err(Error::Configuration(
                "LRC group size must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(Error::Configuration("chunk size must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("storage")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chunk_metadata.db")
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("key.json")
    }

    pub fn container_path(&self) -> PathBuf {
        self.storage_dir().join(crate::CONTAINER_NAME)
    }

    /// Freshness window for peer placement: a peer not seen by the tracker
    /// within this window is not eligible to receive chunks.
    pub fn peer_freshness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.keepalive_interval.as_secs() as i64 * self.peer_loss_threshold as i64,
        )
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("{} = {:?} is not an integer, using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
