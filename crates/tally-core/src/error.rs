//! Errors returned by the store manager

use thiserror::Error;
use uuid::Uuid;

use crate::descriptor::DescriptorError;
use crate::document::DocumentError;
use crate::failure::ErrorKind;
use crate::storage::StorageError;

/// Opening a store failed after recovery
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("A different store is already open: {0}")]
    AlreadyOpen(String),

    #[error("Invalid store descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    #[error("Store could not be opened after {attempts} attempt(s): {kind}")]
    Unrecoverable { kind: ErrorKind, attempts: u32 },
}

impl OpenError {
    /// Classified cause, if the failure came from storage or the cloud
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            OpenError::Unrecoverable { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Saving the store failed; the unsaved changes are kept in memory
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("No store is open")]
    NotOpen,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cloud sync is not enabled for this store")]
    SyncDisabled,

    #[error("No store is open")]
    NotOpen,

    #[error("Could not save before syncing: {0}")]
    Save(#[from] SaveError),

    #[error("Sync failed: {0}")]
    Failed(ErrorKind),
}

#[derive(Error, Debug)]
pub enum ToggleError {
    #[error("No cloud container is configured for this store")]
    MissingContainer,

    #[error("No cloud backend is configured")]
    NoBackend,

    #[error("{}", .0.user_message())]
    AccountUnavailable(ErrorKind),

    #[error("Failed to store sync preference: {0}")]
    Preference(#[source] anyhow::Error),

    #[error("No store is open")]
    NotOpen,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("No store is open")]
    NotOpen,

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Returned by a successful cloud toggle: the new setting applies on next launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct RestartRequired {
    pub cloud_sync_requested: bool,
}

/// Result of a manual sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This call ran a session
    Completed { remote_changes: bool },
    /// A session that started after this request already covered it
    Coalesced,
}
