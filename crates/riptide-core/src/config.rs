//! Configuration for the riptide engine.
//!
//! Resolution order: environment variables → config file → defaults, with
//! command-line flags applied on top by the daemon.
//!
//! Config file location:
//!   1. $RIPTIDE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/riptide/config.toml
//!   3. ~/.config/riptide/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiptideConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP bind for swarm traffic.
    pub listen: String,
    /// TCP bind for the command channel (loopback only).
    pub cmdgw: Option<String>,
    /// TCP bind for the HTTP content gateway (loopback only).
    pub httpgw: Option<String>,
    /// TCP bind for the stats web UI (loopback only).
    pub statsgw: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Destination directory for downloads.
    pub dest_dir: PathBuf,
    /// Content chunk size in bytes.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Seconds without sending before a keepalive goes out.
    pub keepalive_secs: u64,
    /// Seconds without receiving before a channel is closed as idle.
    pub dead_secs: u64,
    /// Initial request retransmit timeout in seconds (doubles per retry).
    pub request_timeout_secs: u64,
    /// Upper bound on the doubled retransmit timeout.
    pub request_timeout_max_secs: u64,
    /// Outstanding request batch size per channel.
    pub request_batch: usize,
    /// Maximum peers returned for one PEX-REQ.
    pub pex_max_peers: usize,
    /// Send-queue depth that triggers CHOKE.
    pub choke_high: usize,
    /// Send-queue depth that triggers UNCHOKE.
    pub choke_low: usize,
}

impl Default for RiptideConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:0".to_string(),
            cmdgw: None,
            httpgw: None,
            statsgw: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::from("."),
            chunk_size: crate::wire::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            dead_secs: 90,
            request_timeout_secs: 4,
            request_timeout_max_secs: 32,
            request_batch: 8,
            pex_max_peers: 10,
            choke_high: 32,
            choke_low: 8,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl RiptideConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RiptideConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RIPTIDE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply RIPTIDE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RIPTIDE_NETWORK__LISTEN") {
            self.network.listen = v;
        }
        if let Ok(v) = std::env::var("RIPTIDE_STORAGE__DEST_DIR") {
            self.storage.dest_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RIPTIDE_STORAGE__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.storage.chunk_size = n;
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("riptide")
}
