//! Cloud backends
//!
//! A cloud backend mirrors the store document into a remote container so
//! several devices can share it. The store manager only sees the
//! [`CloudBackend`] trait: attach once at open, push/pull on demand, and a
//! stream of session events that the event bridge turns into status changes.
//!
//! Two implementations ship with the crate:
//!
//! - [`WebSocketBackend`]: the automerge-repo sync protocol over WebSocket
//! - [`LoopbackCloud`]: replicas kept in memory or in a local directory
//!
//! Backends report failures as [`CloudError`]; nothing outside
//! [`crate::failure`] looks inside those messages.

mod loopback;
mod message;
mod state;
mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::document::StoreDocument;
use crate::store_id::StoreId;

pub use loopback::LoopbackCloud;
pub use message::{ClientMessage, PeerId, ServerMessage};
pub use state::PeerSyncStates;
pub use websocket::WebSocketBackend;

/// Capacity of backend event channels
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors reported by a cloud backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Could not reach the service
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The service did not answer in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The service refused the request
    #[error("Rejected by cloud service: {0}")]
    Rejected(String),

    /// Unexpected or undecodable message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Remote data could not be applied to the local document
    #[error("Document error: {0}")]
    Document(String),

    /// Local I/O while talking to the backend
    #[error("I/O error: {0}")]
    Io(String),
}

/// What a sync session was doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Binding the store to its container
    Setup,
    /// Pulling remote changes
    Import,
    /// Pushing local changes
    Export,
}

/// Events emitted by a backend
#[derive(Debug, Clone, PartialEq)]
pub enum CloudEvent {
    SessionStarted(SessionKind),
    SessionEnded(SessionKind, Option<CloudError>),
}

/// Request to bind a local store to a cloud container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub container: StoreId,
    pub store_id: StoreId,
    pub schema_version: u64,
    pub record_count: usize,
}

/// Outcome of one push/pull exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Whether the local document gained changes from the remote
    pub remote_changes: bool,
}

/// A remote multi-device sync service
///
/// Implementations emit a `SessionStarted`/`SessionEnded` pair for every
/// `attach` and `sync` call.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Bind the store to its container, validating the configuration
    async fn attach(&self, request: &AttachRequest) -> Result<(), CloudError>;

    /// Exchange changes for `container` with the remote, merging into `doc`
    async fn sync(
        &self,
        container: &StoreId,
        doc: &mut StoreDocument,
    ) -> Result<SyncReport, CloudError>;

    /// Check that a usable account is signed in
    async fn account_status(&self) -> Result<(), CloudError> {
        Ok(())
    }

    /// Subscribe to session events
    fn subscribe(&self) -> broadcast::Receiver<CloudEvent>;
}

/// Pick a backend for the configured sync URL
///
/// `ws://` and `wss://` URLs use the sync server protocol; `file://` URLs
/// keep replicas in a local directory. No URL means no backend.
pub fn backend_from_config(config: &Config) -> Result<Option<Arc<dyn CloudBackend>>> {
    let Some(url) = config.sync_url.as_deref() else {
        return Ok(None);
    };

    if url.starts_with("ws://") || url.starts_with("wss://") {
        let state_path = config
            .data_dir
            .join(format!("{}.sync_state.json", config.store_name));
        let backend: Arc<dyn CloudBackend> =
            Arc::new(WebSocketBackend::new(url).with_state_path(state_path)?);
        return Ok(Some(backend));
    }

    if let Some(dir) = url.strip_prefix("file://") {
        let backend: Arc<dyn CloudBackend> =
            Arc::new(LoopbackCloud::in_directory(PathBuf::from(dir)));
        return Ok(Some(backend));
    }

    bail!(
        "Unsupported sync URL '{}': expected ws://, wss:// or file://",
        url
    )
}
