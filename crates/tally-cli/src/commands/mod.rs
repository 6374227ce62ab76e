//! Command handlers

pub mod cloud;
pub mod config;
pub mod record;
pub mod run;
pub mod status;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use tally_core::{
    backend_from_config, CheckpointReport, Config, ConfigPreferences, LifecycleCheckpointer,
    LifecycleTrigger, StoreDescriptor, StoreManager,
};

/// An open store plus the pieces commands need around it
pub struct Session {
    pub config: Config,
    pub manager: Arc<StoreManager>,
    pub checkpointer: Arc<LifecycleCheckpointer>,
}

impl Session {
    /// Build the manager from configuration and open the store
    pub async fn open(config: Config, config_path: Option<&PathBuf>) -> Result<Self> {
        let preferences = Arc::new(ConfigPreferences::new(
            config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path),
        ));
        let backend = backend_from_config(&config).context("Failed to set up sync backend")?;

        let manager = Arc::new(StoreManager::new(preferences, backend));
        let descriptor = StoreDescriptor::from_config(&config, config.sync_enabled);
        manager
            .open(descriptor)
            .await
            .context("Failed to open store")?;

        let checkpointer = Arc::new(LifecycleCheckpointer::new(
            Arc::clone(&manager),
            config.checkpoint_grace(),
        ));

        Ok(Self {
            config,
            manager,
            checkpointer,
        })
    }

    /// Final checkpoint before the process exits
    pub async fn close(self) -> CheckpointReport {
        let report = self
            .checkpointer
            .checkpoint(LifecycleTrigger::Terminate)
            .await;
        if !report.saved {
            warn!("Store was not saved on exit");
        }
        report
    }
}
