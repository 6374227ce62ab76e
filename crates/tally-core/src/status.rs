//! Sync status
//!
//! [`SyncStatusMachine`] holds the transition rules. [`StatusPublisher`] owns
//! the one machine instance for a store and is the only way to change it:
//! every input goes through its mutex, and each transition is published to a
//! `watch` channel (last value wins) and to registered observers in order.
//!
//! ```text
//! Disabled ──Opened{cloud}──▶ Enabled ──SessionStarted/ManualSync──▶ Syncing
//!                               ▲  ▲                                  │  │
//!                               │  └──────────SessionAbandoned────────┘  │
//!                               │               Synced ◀──SessionEnded───┘
//! any ──OpenFailed──▶ Error(k) ─┴─Recovered{cloud}──▶ Enabled | Disabled
//! ```

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::failure::ErrorKind;

/// Published sync state of a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum SyncStatus {
    Disabled,
    Enabled,
    Syncing,
    Synced,
    Error(ErrorKind),
}

impl SyncStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SyncStatus::Error(_))
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Disabled => write!(f, "disabled"),
            SyncStatus::Enabled => write!(f, "enabled"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Error(kind) => write!(f, "error: {}", kind),
        }
    }
}

/// Inputs to the machine
///
/// Failures arrive already classified; there is no input carrying a raw error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusInput {
    /// Store opened without error
    Opened { cloud: bool },
    /// The backend started a session
    SessionStarted,
    /// A manual sync was requested
    ManualSync,
    /// A session ended without error
    SessionEnded,
    /// A session ended with an error the user should see
    SessionFailed(ErrorKind),
    /// A session ended with a benign error
    SessionAbandoned,
    /// Opening the store failed
    OpenFailed(ErrorKind),
    /// Writing the store to disk failed
    SaveFailed(ErrorKind),
    /// A recovery action completed
    Recovered { cloud: bool },
}

/// Transition rules for [`SyncStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusMachine {
    state: SyncStatus,
}

impl Default for SyncStatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusMachine {
    pub fn new() -> Self {
        Self {
            state: SyncStatus::Disabled,
        }
    }

    pub fn state(&self) -> &SyncStatus {
        &self.state
    }

    /// Apply an input, returning the new state if it changed
    ///
    /// Inputs that make no sense in the current state (duplicates, late or
    /// out-of-order events) leave the state alone.
    pub fn apply(&mut self, input: StatusInput) -> Option<SyncStatus> {
        use StatusInput as I;
        use SyncStatus as S;

        let next = match (&self.state, input) {
            (S::Disabled, I::Opened { cloud: true }) => S::Enabled,

            (S::Enabled | S::Synced, I::SessionStarted | I::ManualSync) => S::Syncing,
            (S::Syncing, I::SessionEnded) => S::Synced,
            (S::Syncing, I::SessionAbandoned) => S::Enabled,
            (S::Enabled | S::Syncing | S::Synced, I::SessionFailed(kind)) => S::Error(kind),

            (_, I::OpenFailed(kind) | I::SaveFailed(kind)) => S::Error(kind),

            (S::Error(_), I::Recovered { cloud: true }) => S::Enabled,
            (S::Error(_), I::Recovered { cloud: false }) => S::Disabled,

            (state, input) => {
                debug!(state = %state, input = ?input, "Ignoring status input");
                return None;
            }
        };

        if next == self.state {
            return None;
        }

        debug!(from = %self.state, to = %next, "Sync status transition");
        self.state = next.clone();
        Some(next)
    }
}

/// Callback run on every status transition
pub type StatusObserver = Box<dyn Fn(&SyncStatus) + Send + Sync>;

struct PublisherState {
    machine: SyncStatusMachine,
    observers: Vec<StatusObserver>,
}

/// Owner of a store's status machine
///
/// Observers run while the publisher lock is held, so they see transitions
/// in order. They must not call back into the publisher.
pub struct StatusPublisher {
    state: Mutex<PublisherState>,
    tx: watch::Sender<SyncStatus>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::Disabled);
        Self {
            state: Mutex::new(PublisherState {
                machine: SyncStatusMachine::new(),
                observers: Vec::new(),
            }),
            tx,
        }
    }

    /// Apply an input and publish the transition, if any
    pub fn apply(&self, input: StatusInput) -> Option<SyncStatus> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let next = state.machine.apply(input)?;
        self.tx.send_replace(next.clone());
        for observer in &state.observers {
            observer(&next);
        }

        if let SyncStatus::Error(kind) = &next {
            info!(error = %kind, "Sync status is now error");
        }
        Some(next)
    }

    /// Current status
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Receiver that always holds the latest status
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Register a callback for future transitions
    pub fn observe(&self, observer: StatusObserver) {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observers
            .push(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn run(inputs: Vec<StatusInput>) -> Vec<SyncStatus> {
        let mut machine = SyncStatusMachine::new();
        inputs
            .into_iter()
            .filter_map(|input| machine.apply(input))
            .collect()
    }

    #[test]
    fn test_happy_path() {
        let seen = run(vec![
            StatusInput::Opened { cloud: true },
            StatusInput::SessionStarted,
            StatusInput::SessionEnded,
        ]);
        assert_eq!(
            seen,
            vec![SyncStatus::Enabled, SyncStatus::Syncing, SyncStatus::Synced]
        );
    }

    #[test]
    fn test_local_open_stays_disabled() {
        let mut machine = SyncStatusMachine::new();
        assert_eq!(machine.apply(StatusInput::Opened { cloud: false }), None);
        assert_eq!(machine.state(), &SyncStatus::Disabled);
    }

    #[test]
    fn test_duplicate_session_started_collapses() {
        let seen = run(vec![
            StatusInput::Opened { cloud: true },
            StatusInput::SessionStarted,
            StatusInput::SessionStarted,
            StatusInput::ManualSync,
        ]);
        assert_eq!(seen, vec![SyncStatus::Enabled, SyncStatus::Syncing]);
    }

    #[test]
    fn test_out_of_order_end_is_ignored() {
        let seen = run(vec![
            StatusInput::Opened { cloud: true },
            StatusInput::SessionEnded,
        ]);
        assert_eq!(seen, vec![SyncStatus::Enabled]);
    }

    #[test]
    fn test_disabled_never_reaches_synced() {
        let all_inputs = || {
            vec![
                StatusInput::SessionStarted,
                StatusInput::ManualSync,
                StatusInput::SessionEnded,
                StatusInput::SessionAbandoned,
                StatusInput::SessionFailed(ErrorKind::NetworkFailure),
                StatusInput::Opened { cloud: false },
                StatusInput::Recovered { cloud: true },
                StatusInput::Recovered { cloud: false },
            ]
        };

        // From Disabled, no single input other than a successful cloud
        // open or a failure moves the machine anywhere near Synced
        for input in all_inputs() {
            let mut machine = SyncStatusMachine::new();
            machine.apply(input.clone());
            assert_ne!(machine.state(), &SyncStatus::Synced, "{input:?}");
        }

        // Every path that ends in Synced went through Enabled first
        for first in all_inputs() {
            for second in all_inputs() {
                let mut machine = SyncStatusMachine::new();
                let mut seen = vec![SyncStatus::Disabled];
                for input in [first.clone(), second.clone()] {
                    if let Some(next) = machine.apply(input) {
                        seen.push(next);
                    }
                }
                assert!(!seen.contains(&SyncStatus::Synced), "{seen:?}");
            }
        }
    }

    #[test]
    fn test_session_failure_and_recovery() {
        let seen = run(vec![
            StatusInput::Opened { cloud: true },
            StatusInput::SessionStarted,
            StatusInput::SessionFailed(ErrorKind::NetworkFailure),
            // Late end for the failed session
            StatusInput::SessionEnded,
            StatusInput::Recovered { cloud: true },
        ]);
        assert_eq!(
            seen,
            vec![
                SyncStatus::Enabled,
                SyncStatus::Syncing,
                SyncStatus::Error(ErrorKind::NetworkFailure),
                SyncStatus::Enabled,
            ]
        );
    }

    #[test]
    fn test_error_only_left_by_recovery() {
        let mut machine = SyncStatusMachine::new();
        machine.apply(StatusInput::OpenFailed(ErrorKind::SchemaMigrationFailure));

        for input in [
            StatusInput::Opened { cloud: true },
            StatusInput::SessionStarted,
            StatusInput::ManualSync,
            StatusInput::SessionEnded,
            StatusInput::SessionAbandoned,
        ] {
            assert_eq!(machine.apply(input), None);
        }

        assert_eq!(
            machine.apply(StatusInput::Recovered { cloud: false }),
            Some(SyncStatus::Disabled)
        );
    }

    #[test]
    fn test_open_failure_from_any_state() {
        let seen = run(vec![
            StatusInput::Opened { cloud: true },
            StatusInput::SessionStarted,
            StatusInput::OpenFailed(ErrorKind::QuotaExceeded),
            StatusInput::OpenFailed(ErrorKind::QuotaExceeded),
        ]);
        assert_eq!(
            seen.last(),
            Some(&SyncStatus::Error(ErrorKind::QuotaExceeded))
        );
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_save_failure_on_local_store() {
        let seen = run(vec![
            StatusInput::Opened { cloud: false },
            StatusInput::SaveFailed(ErrorKind::QuotaExceeded),
            StatusInput::Recovered { cloud: false },
        ]);
        assert_eq!(
            seen,
            vec![
                SyncStatus::Error(ErrorKind::QuotaExceeded),
                SyncStatus::Disabled
            ]
        );
    }

    #[test]
    fn test_abandoned_session_returns_to_enabled() {
        let seen = run(vec![
            StatusInput::Opened { cloud: true },
            StatusInput::SessionStarted,
            StatusInput::SessionAbandoned,
        ]);
        assert_eq!(seen.last(), Some(&SyncStatus::Enabled));
    }

    #[test]
    fn test_publisher_watch_and_observers() {
        let publisher = StatusPublisher::new();
        let rx = publisher.subscribe();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        publisher.observe(Box::new(move |status| {
            sink.lock().unwrap().push(status.clone());
        }));

        publisher.apply(StatusInput::Opened { cloud: true });
        publisher.apply(StatusInput::SessionStarted);
        publisher.apply(StatusInput::SessionStarted);
        publisher.apply(StatusInput::SessionEnded);

        assert_eq!(publisher.current(), SyncStatus::Synced);
        assert_eq!(*rx.borrow(), SyncStatus::Synced);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SyncStatus::Enabled, SyncStatus::Syncing, SyncStatus::Synced]
        );
    }

    #[test]
    fn test_status_serializes_with_error_detail() {
        let json = serde_json::to_value(SyncStatus::Error(ErrorKind::NetworkFailure)).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["error"]["kind"], "network_failure");
        assert_eq!(
            serde_json::to_value(SyncStatus::Synced).unwrap()["state"],
            "synced"
        );
    }
}
