//! Node configuration.
//!
//! Every section is a plain struct with a `Default` and
//! `#[serde(default)]`, so a config file only needs the keys it wants to
//! change. [`AuthGateConfig::load_or_create`] writes the full set back,
//! which leaves operators with a file that lists every option.

use std::path::{Path, PathBuf};
use std::time::Duration;

use authgate_session::SessionConfig;
use authgate_sync::{ClientConfig, HubConfig};
use authgate_totp::TotpConfig;
use serde::{Deserialize, Serialize};

use crate::AuthGateError;

/// Which gameplay actions are held back until a player verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub block_movement: bool,
    pub block_chat: bool,
    pub block_commands: bool,
    pub block_server_switch: bool,

    /// Commands allowed before verification even when `block_commands`
    /// is on. The `2fa` command itself never needs listing.
    pub whitelisted_commands: Vec<String>,

    /// Commands denied before verification even when `block_commands`
    /// is off.
    pub blacklisted_commands: Vec<String>,

    /// Consecutive wrong codes before the player is kicked. `0` never
    /// kicks.
    pub max_failed_attempts: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            block_movement: true,
            block_chat: true,
            block_commands: true,
            block_server_switch: true,
            whitelisted_commands: Vec::new(),
            blacklisted_commands: Vec::new(),
            max_failed_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub enabled: bool,

    /// How long a used code stays rejected. `None` covers every window
    /// the TOTP settings accept a code in.
    pub ttl_secs: Option<u64>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: None,
        }
    }
}

/// Where credentials live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageBackend {
    /// Lost on restart. Tests and throwaway servers.
    Memory,
    Sqlite { path: PathBuf },
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Prepended to `players` to name the SQL table.
    pub table_prefix: String,

    /// Store calls allowed in flight at once.
    pub workers: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite {
                path: PathBuf::from("authgate.db"),
            },
            table_prefix: "2fa_".to_string(),
            workers: 4,
        }
    }
}

/// This node's place in the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncRole {
    /// A single server with no proxy in front.
    Standalone,
    /// The proxy: owns auth state and serves backends on `bind`.
    Proxy { bind: String },
    /// A backend server that mirrors the proxy at `proxy_url`.
    Backend { proxy_url: String, node: String },
}

impl SyncRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Proxy { .. } => "proxy",
            Self::Backend { .. } => "backend",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub role: SyncRole,
    pub staleness_secs: u64,
    pub query_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_secs: u64,
}

impl SyncConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            handshake_timeout_ms: self.handshake_timeout_ms,
            idle_timeout_secs: self.idle_timeout_secs,
        }
    }

    pub fn client_config(&self, node: &str) -> ClientConfig {
        ClientConfig {
            node: node.to_string(),
            staleness_secs: self.staleness_secs,
            query_timeout_ms: self.query_timeout_ms,
            reconnect_delay_ms: self.reconnect_delay_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let hub = HubConfig::default();
        let client = ClientConfig::default();
        Self {
            role: SyncRole::Standalone,
            staleness_secs: client.staleness_secs,
            query_timeout_ms: client.query_timeout_ms,
            reconnect_delay_ms: client.reconnect_delay_ms,
            heartbeat_interval_ms: client.heartbeat_interval_ms,
            handshake_timeout_ms: hub.handshake_timeout_ms,
            idle_timeout_secs: hub.idle_timeout_secs,
        }
    }
}

/// Everything a node reads at startup and on reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthGateConfig {
    pub gate: GateConfig,
    pub session: SessionConfig,
    pub totp: TotpConfig,
    pub replay: ReplayConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

impl AuthGateConfig {
    /// Replay-cache TTL for these settings.
    pub fn replay_ttl(&self) -> Duration {
        match self.replay.ttl_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                let windows = 2 * self.totp.skew_steps.min(1) + 1;
                Duration::from_secs(self.totp.step_secs * windows)
            }
        }
    }

    /// Reads `path`, filling in defaults for anything missing. A missing
    /// file is created, and a file missing keys is rewritten with them.
    ///
    /// # Errors
    /// [`AuthGateError::ConfigIo`] if the file can't be read or written,
    /// [`AuthGateError::ConfigParse`] if it isn't valid config JSON.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, AuthGateError> {
        let path = path.as_ref();
        let io_err = |source| AuthGateError::ConfigIo {
            path: path.to_path_buf(),
            source,
        };
        let parse_err = |source| AuthGateError::ConfigParse {
            path: path.to_path_buf(),
            source,
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                tracing::info!(path = %path.display(), "wrote default config");
                return Ok(config);
            }
            Err(e) => return Err(io_err(e)),
        };

        let found: serde_json::Value = serde_json::from_str(&raw).map_err(parse_err)?;
        let config: Self = serde_json::from_value(found.clone()).map_err(parse_err)?;
        let complete = serde_json::to_value(&config).map_err(parse_err)?;
        if complete != found {
            config.save(path)?;
            tracing::info!(path = %path.display(), "added missing keys to config");
        }
        Ok(config)
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AuthGateError> {
        let path = path.as_ref();
        let io_err = |source| AuthGateError::ConfigIo {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| AuthGateError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }
}
