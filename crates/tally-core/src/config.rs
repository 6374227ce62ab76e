//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tally/config.toml)
//! 3. Environment variables (TALLY_* prefix)
//!
//! Environment variables take precedence over config file values.
//!
//! `sync_enabled` is the durable cloud-sync preference. It is read once when
//! the store descriptor is built and written only when the user toggles sync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "TALLY";

/// Default grace period for lifecycle checkpoints
pub const DEFAULT_CHECKPOINT_GRACE_MS: u64 = 3000;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (Automerge doc, SQLite db)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Store name, used for the document and database file names
    #[serde(default = "default_store_name")]
    pub store_name: String,

    /// Sync server URL (`ws://`, `wss://` or `file://`)
    #[serde(default)]
    pub sync_url: Option<String>,

    /// Whether the user asked for cloud sync
    #[serde(default)]
    pub sync_enabled: bool,

    /// Cloud container the store is mirrored into (bs58check or automerge: URL)
    #[serde(default)]
    pub cloud_container_id: Option<String>,

    /// Time budget for lifecycle checkpoints, in milliseconds
    #[serde(default = "default_checkpoint_grace_ms")]
    pub checkpoint_grace_ms: u64,

    /// Periodic autosave for long-running hosts, in seconds
    #[serde(default)]
    pub autosave_interval_secs: Option<u64>,

    /// Log file path (logs go to stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store_name: default_store_name(),
            sync_url: None,
            sync_enabled: false,
            cloud_container_id: None,
            checkpoint_grace_ms: DEFAULT_CHECKPOINT_GRACE_MS,
            autosave_interval_secs: None,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TALLY_DATA_DIR, TALLY_SYNC_URL, ...)
    /// 2. Config file (~/.config/tally/config.toml or TALLY_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
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
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_URL", ENV_PREFIX)) {
            self.sync_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = parse_bool(&val);
        }

        if let Ok(val) = std::env::var(format!("{}_CLOUD_CONTAINER", ENV_PREFIX)) {
            self.cloud_container_id = non_empty(val);
        }
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Set a value by key, as used by `tally config set`
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = value.into(),
            "store_name" => {
                if value.is_empty() || value.contains(['/', '\\']) {
                    bail!("Invalid store name: '{}'", value);
                }
                self.store_name = value.to_string();
            }
            "sync_url" => self.sync_url = optional(value),
            "sync_enabled" => {
                self.sync_enabled = value
                    .parse()
                    .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
            }
            "cloud_container_id" => self.cloud_container_id = optional(value),
            "checkpoint_grace_ms" => {
                self.checkpoint_grace_ms = value
                    .parse()
                    .context("Invalid value for checkpoint_grace_ms. Use milliseconds.")?;
            }
            "autosave_interval_secs" => {
                self.autosave_interval_secs = match optional(value) {
                    Some(v) => Some(
                        v.parse()
                            .context("Invalid value for autosave_interval_secs. Use seconds.")?,
                    ),
                    None => None,
                };
            }
            "log_file" => self.log_file = optional(value).map(PathBuf::from),
            _ => bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: {}",
                key,
                Self::KEYS.join(", ")
            ),
        }
        Ok(())
    }

    /// Keys accepted by [`set_value`](Self::set_value)
    pub const KEYS: &'static [&'static str] = &[
        "data_dir",
        "store_name",
        "sync_url",
        "sync_enabled",
        "cloud_container_id",
        "checkpoint_grace_ms",
        "autosave_interval_secs",
        "log_file",
    ];

    /// Get the config file path
    ///
    /// Can be overridden with TALLY_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tally")
            .join("config.toml")
    }

    /// Get the path to the Automerge document file
    pub fn document_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.automerge", self.store_name))
    }

    /// Checkpoint grace period
    pub fn checkpoint_grace(&self) -> Duration {
        Duration::from_millis(self.checkpoint_grace_ms)
    }

    /// Autosave interval, if configured and non-zero
    pub fn autosave_interval(&self) -> Option<Duration> {
        self.autosave_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
}

fn default_store_name() -> String {
    "default".to_string()
}

fn default_checkpoint_grace_ms() -> u64 {
    DEFAULT_CHECKPOINT_GRACE_MS
}
