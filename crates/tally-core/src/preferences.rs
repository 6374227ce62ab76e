//! Durable cloud-sync preference
//!
//! The preference records what the user asked for, not what the running store
//! can currently do. Recovery paths that turn cloud off for the live store
//! never write it; only an explicit toggle does.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Context, Result};

use crate::config::Config;

/// Storage for the user's cloud-sync preference
pub trait PreferenceStore: Send + Sync {
    /// Whether the user asked for cloud sync
    fn cloud_sync_requested(&self) -> Result<bool>;

    /// Durably record the user's choice
    fn set_cloud_sync_requested(&self, enabled: bool) -> Result<()>;
}

/// Preference stored as `sync_enabled` in the config file
pub struct ConfigPreferences {
    path: PathBuf,
}

impl ConfigPreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Preferences backed by the default config file
    pub fn default_location() -> Self {
        Self::new(Config::config_file_path())
    }
}

impl PreferenceStore for ConfigPreferences {
    fn cloud_sync_requested(&self) -> Result<bool> {
        let config = Config::load_from_path(&self.path)
            .with_context(|| format!("Failed to read sync preference from {:?}", self.path))?;
        Ok(config.sync_enabled)
    }

    fn set_cloud_sync_requested(&self, enabled: bool) -> Result<()> {
        // Raw file, so env overrides are never written back
        let mut config = if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read config file: {:?}", self.path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", self.path))?
        } else {
            Config::default()
        };

        config.sync_enabled = enabled;
        config
            .save_to_path(&self.path)
            .context("Failed to save sync preference")
    }
}

/// In-memory preference, for tests and embedding hosts
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    requested: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryPreferences {
    pub fn new(requested: bool) -> Self {
        Self {
            requested: AtomicBool::new(requested),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of times the preference has been written
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current value without going through the trait
    pub fn get(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl PreferenceStore for MemoryPreferences {
    fn cloud_sync_requested(&self) -> Result<bool> {
        Ok(self.get())
    }

    fn set_cloud_sync_requested(&self, enabled: bool) -> Result<()> {
        self.requested.store(enabled, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
