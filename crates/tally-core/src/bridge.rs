//! Cloud event bridge
//!
//! Forwards backend session events onto the store's [`StatusPublisher`].
//! Session errors are classified before they reach the status machine, and
//! completed or failed sessions are re-broadcast as [`SyncNotification`]s.
//!
//! `Export` sessions are started by [`StoreManager::request_sync`], which
//! applies their status itself so the result is settled when the call
//! returns. The bridge skips them to avoid replaying a finished session.
//!
//! [`StoreManager::request_sync`]: crate::manager::StoreManager::request_sync

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::{FailureClassifier, RecoveryAction};
use crate::cloud::{CloudEvent, SessionKind, EVENT_CHANNEL_CAPACITY};
use crate::failure::ErrorKind;
use crate::status::{StatusInput, StatusPublisher, SyncStatus};

/// Sync outcome broadcast to collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    Completed { at: DateTime<Utc> },
    Failed(ErrorKind),
}

/// State shared between the store manager and the bridge task
pub(crate) struct Shared {
    pub(crate) status: StatusPublisher,
    /// Whether the live store is mirrored to the cloud
    pub(crate) cloud_live: AtomicBool,
    pub(crate) notifications: broadcast::Sender<SyncNotification>,
    pub(crate) classifier: FailureClassifier,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (notifications, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status: StatusPublisher::new(),
            cloud_live: AtomicBool::new(false),
            notifications,
            classifier: FailureClassifier::new(),
        }
    }

    pub(crate) fn is_cloud_live(&self) -> bool {
        self.cloud_live.load(Ordering::SeqCst)
    }

    fn notify(&self, notification: SyncNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }
}

/// Apply one cloud event to the status machine
pub(crate) fn handle_event(shared: &Shared, event: &CloudEvent) {
    if !shared.is_cloud_live() {
        debug!(event = ?event, "Cloud is off for this store, ignoring event");
        return;
    }

    match event {
        CloudEvent::SessionStarted(kind) => {
            debug!(session = ?kind, "Cloud session started");
            shared.status.apply(StatusInput::SessionStarted);
        }
        CloudEvent::SessionEnded(kind, None) => {
            debug!(session = ?kind, "Cloud session ended");
            if shared.status.apply(StatusInput::SessionEnded) == Some(SyncStatus::Synced) {
                shared.notify(SyncNotification::Completed { at: Utc::now() });
            }
        }
        CloudEvent::SessionEnded(kind, Some(error)) => {
            let error_kind = ErrorKind::from_cloud(error);
            warn!(session = ?kind, error = %error, "Cloud session failed");

            match shared.classifier.classify(&error_kind) {
                RecoveryAction::Ignore => {
                    shared.status.apply(StatusInput::SessionAbandoned);
                }
                RecoveryAction::SurfaceToUser(_) | RecoveryAction::RecreateStore => {
                    // A destructive recreate needs a restart; only report it here
                    if shared
                        .status
                        .apply(StatusInput::SessionFailed(error_kind.clone()))
                        .is_some()
                    {
                        shared.notify(SyncNotification::Failed(error_kind));
                    }
                }
                RecoveryAction::RecreateStoreWithoutCloud => {
                    shared
                        .status
                        .apply(StatusInput::SessionFailed(error_kind.clone()));
                    shared.cloud_live.store(false, Ordering::SeqCst);
                    shared.status.apply(StatusInput::Recovered { cloud: false });
                    info!(reason = %error_kind, "Cloud sync turned off for this session");
                    shared.notify(SyncNotification::Failed(error_kind));
                }
            }
        }
    }
}

/// Background task forwarding backend events
pub struct CloudEventBridge {
    handle: JoinHandle<()>,
}

impl CloudEventBridge {
    pub(crate) fn spawn(shared: Arc<Shared>, mut events: broadcast::Receiver<CloudEvent>) -> Self {
        let handle = tokio::spawn(async move {
            debug!("Cloud event bridge started");
            loop {
                match events.recv().await {
                    Ok(CloudEvent::SessionStarted(SessionKind::Export))
                    | Ok(CloudEvent::SessionEnded(SessionKind::Export, _)) => {}
                    Ok(event) => handle_event(&shared, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Cloud event bridge fell behind, events dropped");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Cloud event channel closed");
                        break;
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for CloudEventBridge {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
