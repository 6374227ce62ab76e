//! Tally Core Library
//!
//! Store lifecycle and cloud-sync recovery for Tally. The crate opens a
//! local durable store, optionally mirrors it to a multi-device sync
//! service, recovers from open and sync failures, and checkpoints data at
//! application lifecycle boundaries.
//!
//! # Architecture
//!
//! - **Automerge**: source of truth, one document per store
//! - **SQLite**: derived read projection for queries and full-text search
//! - **Cloud backend**: automerge-repo sync server over WebSocket, or a
//!   loopback replica directory
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let prefs = Arc::new(ConfigPreferences::default_location());
//! let backend = backend_from_config(&config)?;
//!
//! let manager = Arc::new(StoreManager::new(prefs.clone(), backend));
//! let descriptor = StoreDescriptor::from_config(&config, prefs.cloud_sync_requested()?);
//! manager.open(descriptor).await?;
//!
//! manager.insert(&Record::new("project").with_field("name", "Deck")).await?;
//! manager.save().await?;
//! ```
//!
//! # Modules
//!
//! - `manager`: store owner (main entry point)
//! - `status`: sync status machine and publisher
//! - `failure` / `classifier`: error classification and recovery choice
//! - `bridge`: cloud session events to status
//! - `checkpoint`: lifecycle-triggered saves
//! - `cloud`: backends
//! - `storage`, `document`: persistence and projection
//! - `config`, `preferences`, `descriptor`: setup

pub mod bridge;
pub mod checkpoint;
pub mod classifier;
pub mod cloud;
pub mod config;
pub mod descriptor;
pub mod document;
pub mod error;
pub mod failure;
pub mod manager;
pub mod models;
pub mod preferences;
pub mod status;
pub mod storage;
pub mod store_id;

pub use bridge::{CloudEventBridge, SyncNotification};
pub use checkpoint::{
    CheckpointEvent, CheckpointReport, LifecycleCheckpointer, LifecycleTrigger, SyncDispatch,
};
pub use classifier::{FailureClassifier, RecoveryAction};
pub use cloud::{
    backend_from_config, AttachRequest, CloudBackend, CloudError, CloudEvent, LoopbackCloud,
    SessionKind, SyncReport, WebSocketBackend,
};
pub use config::Config;
pub use descriptor::{DescriptorError, StoreDescriptor};
pub use document::{DocumentError, StoreDocument, CURRENT_SCHEMA_VERSION};
pub use error::{
    OpenError, RecordError, RestartRequired, SaveError, SyncError, SyncOutcome, ToggleError,
};
pub use failure::ErrorKind;
pub use manager::StoreManager;
pub use models::Record;
pub use preferences::{ConfigPreferences, MemoryPreferences, PreferenceStore};
pub use status::{StatusInput, StatusPublisher, SyncStatus, SyncStatusMachine};
pub use storage::{RecordQuery, StorageError, StorageStats};
pub use store_id::{StoreId, StoreIdError};
