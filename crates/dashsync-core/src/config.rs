//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/dashsync/config.toml)
//! 3. Environment variables (DASHSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::connection::{connection_url, ConnectionConfig, ReconnectPolicy};
use crate::storage::{atomic_write, OFFLINE_QUEUE_FILE, SYNC_STATE_FILE};

/// Environment variable prefix
const ENV_PREFIX: &str = "DASHSYNC";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sync server WebSocket URL (`ws://` or `wss://`)
    #[serde(default)]
    pub server_url: Option<String>,

    /// Bearer token sent as the `token` query parameter
    #[serde(default)]
    pub token: Option<String>,

    /// Directory for sync state and the offline queue
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Default log level when `--log-level` is not given
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub sync: SyncSettings,
}

/// Timing and capacity settings (`[sync]` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub connect_timeout_ms: u64,
    pub subscription_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_multiplier: u32,
    pub reconnect_base_ms: u64,
    pub max_reconnect_attempts: u32,
    pub conflict_window_ms: u64,
    pub queue_capacity: usize,
    /// Mirror the offline queue to disk
    pub persist_queue: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            subscription_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_multiplier: 2,
            reconnect_base_ms: 1_000,
            max_reconnect_attempts: 5,
            conflict_window_ms: 5_000,
            queue_capacity: 1_000,
            persist_queue: true,
        }
    }
}

impl SyncSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_millis(self.conflict_window_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_interval: Duration::from_millis(self.reconnect_base_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
            value
                .parse()
                .ok()
                .with_context(|| format!("Invalid value for sync.{}: '{}'", field, value))
        }

        match field {
            "connect_timeout_ms" => self.connect_timeout_ms = parse(field, value)?,
            "subscription_timeout_ms" => self.subscription_timeout_ms = parse(field, value)?,
            "heartbeat_interval_ms" => self.heartbeat_interval_ms = parse(field, value)?,
            "heartbeat_timeout_multiplier" => {
                self.heartbeat_timeout_multiplier = parse(field, value)?
            }
            "reconnect_base_ms" => self.reconnect_base_ms = parse(field, value)?,
            "max_reconnect_attempts" => self.max_reconnect_attempts = parse(field, value)?,
            "conflict_window_ms" => self.conflict_window_ms = parse(field, value)?,
            "queue_capacity" => self.queue_capacity = parse(field, value)?,
            "persist_queue" => self.persist_queue = parse(field, value)?,
            _ => bail!("Unknown configuration key: 'sync.{}'", field),
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            data_dir: default_data_dir(),
            log_file: None,
            log_level: None,
            sync: SyncSettings::default(),
        }
    }
}

/// Keys accepted by [`Config::set_value`]
pub const CONFIG_KEYS: &[&str] = &[
    "server_url",
    "token",
    "data_dir",
    "log_file",
    "log_level",
    "sync.connect_timeout_ms",
    "sync.subscription_timeout_ms",
    "sync.heartbeat_interval_ms",
    "sync.heartbeat_timeout_multiplier",
    "sync.reconnect_base_ms",
    "sync.max_reconnect_attempts",
    "sync.conflict_window_ms",
    "sync.queue_capacity",
    "sync.persist_queue",
];

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DASHSYNC_SERVER_URL, DASHSYNC_TOKEN, DASHSYNC_DATA_DIR, DASHSYNC_LOG)
    /// 2. Config file (~/.config/dashsync/config.toml or DASHSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from `path` when given, otherwise from the default location
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            self.server_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_TOKEN", ENV_PREFIX)) {
            self.token = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_LOG", ENV_PREFIX)) {
            self.log_level = non_empty(val);
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {:?}", path))
    }

    /// Set one value by its dotted key (`server_url`, `sync.queue_capacity`, ...)
    ///
    /// An empty value or `none` clears optional keys.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = || non_empty(value.to_string()).filter(|v| v != "none");
        match key {
            "server_url" => {
                if let Some(ref url) = optional() {
                    connection_url(url, None)
                        .with_context(|| format!("Invalid server_url '{}'", url))?;
                }
                self.server_url = optional();
            }
            "token" => self.token = optional(),
            "data_dir" => self.data_dir = PathBuf::from(value),
            "log_file" => self.log_file = optional().map(PathBuf::from),
            "log_level" => self.log_level = optional(),
            _ => match key.strip_prefix("sync.") {
                Some(field) => self.sync.set(field, value)?,
                None => bail!(
                    "Unknown configuration key: '{}'\nValid keys: {}",
                    key,
                    CONFIG_KEYS.join(", ")
                ),
            },
        }
        Ok(())
    }

    /// Connection settings for the configured server
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let Some(ref url) = self.server_url else {
            bail!(
                "Server URL not configured. Set it with:\n  \
                 dashsync config set server_url ws://your-server:8080/ws"
            );
        };
        connection_url(url, self.token.as_deref())
            .with_context(|| format!("Invalid server_url '{}'", url))?;

        Ok(ConnectionConfig {
            url: url.clone(),
            token: self.token.clone(),
            connect_timeout: self.sync.connect_timeout(),
            heartbeat_interval: self.sync.heartbeat_interval(),
            heartbeat_timeout_multiplier: self.sync.heartbeat_timeout_multiplier,
            reconnect: self.sync.reconnect_policy(),
        })
    }

    /// Get the config file path
    ///
    /// Can be overridden with DASHSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dashsync")
            .join("config.toml")
    }

    /// Get the path to the persisted sync state
    pub fn sync_state_path(&self) -> PathBuf {
        self.data_dir.join(SYNC_STATE_FILE)
    }

    /// Get the path to the persisted offline queue
    pub fn offline_queue_path(&self) -> PathBuf {
        self.data_dir.join(OFFLINE_QUEUE_FILE)
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dashsync")
}
