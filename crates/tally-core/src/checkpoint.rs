//! Lifecycle checkpoints
//!
//! The host forwards application lifecycle changes (going to the background,
//! losing focus, terminating) as [`LifecycleTrigger`]s. Each one saves the
//! store and, when cloud sync is live, starts a sync that gets whatever is
//! left of the grace period.
//!
//! The save itself is never cut short: a checkpoint that takes longer than
//! the grace period still finishes writing and only logs a warning.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{SaveError, SyncError};
use crate::failure::ErrorKind;
use crate::manager::StoreManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleTrigger {
    BackgroundEntry,
    Terminate,
    ForegroundLoss,
}

impl fmt::Display for LifecycleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleTrigger::BackgroundEntry => write!(f, "background_entry"),
            LifecycleTrigger::Terminate => write!(f, "terminate"),
            LifecycleTrigger::ForegroundLoss => write!(f, "foreground_loss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointEvent {
    pub trigger: LifecycleTrigger,
    pub timestamp: DateTime<Utc>,
}

/// What happened to the sync started by a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum SyncDispatch {
    /// Cloud is off, or the store could not sync
    Skipped,
    /// The sync finished within the grace period
    Flushed,
    /// Still running when the grace period ran out
    Pending,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    pub event: CheckpointEvent,
    pub saved: bool,
    pub sync: SyncDispatch,
}

/// Saves the store at lifecycle boundaries
pub struct LifecycleCheckpointer {
    manager: Arc<StoreManager>,
    grace: Duration,
}

impl LifecycleCheckpointer {
    pub fn new(manager: Arc<StoreManager>, grace: Duration) -> Self {
        Self { manager, grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Save now, then give a sync the rest of the grace period
    pub async fn checkpoint(&self, trigger: LifecycleTrigger) -> CheckpointReport {
        let event = CheckpointEvent {
            trigger,
            timestamp: Utc::now(),
        };
        let started = Instant::now();
        debug!(trigger = %trigger, "Checkpoint");

        let saved = match self.manager.save().await {
            Ok(()) => true,
            Err(SaveError::NotOpen) => {
                debug!("No store open, nothing to checkpoint");
                false
            }
            Err(e) => {
                error!(trigger = %trigger, error = %e, "Checkpoint save failed");
                false
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.grace {
            warn!(
                trigger = %trigger,
                elapsed_ms = elapsed.as_millis() as u64,
                grace_ms = self.grace.as_millis() as u64,
                "Checkpoint save overran its grace period"
            );
        }

        let sync = if self.manager.is_cloud_enabled() {
            self.dispatch_sync(self.grace.saturating_sub(elapsed)).await
        } else {
            SyncDispatch::Skipped
        };

        info!(trigger = %trigger, saved, sync = ?sync, "Checkpoint complete");
        CheckpointReport { event, saved, sync }
    }

    async fn dispatch_sync(&self, budget: Duration) -> SyncDispatch {
        let handle = self.manager.spawn_sync();

        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(Ok(_))) => SyncDispatch::Flushed,
            Ok(Ok(Err(SyncError::Failed(kind)))) => SyncDispatch::Failed(kind),
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "Checkpoint sync skipped");
                SyncDispatch::Skipped
            }
            Ok(Err(e)) => {
                error!(error = %e, "Checkpoint sync task failed");
                SyncDispatch::Failed(ErrorKind::Unknown(e.to_string()))
            }
            Err(_) => {
                // The task keeps running detached
                debug!(budget_ms = budget.as_millis() as u64, "Checkpoint sync still running");
                SyncDispatch::Pending
            }
        }
    }

    /// Run checkpoints for triggers from `signals` until `Terminate` or
    /// until the channel closes
    ///
    /// With `autosave`, unsaved changes are also written on that period.
    /// Returns the report of every checkpoint that ran.
    pub fn spawn(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<LifecycleTrigger>,
        autosave: Option<Duration>,
    ) -> JoinHandle<Vec<CheckpointReport>> {
        tokio::spawn(async move {
            let mut ticker = autosave.map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval
            });
            let mut reports = Vec::new();

            loop {
                tokio::select! {
                    trigger = signals.recv() => {
                        let Some(trigger) = trigger else {
                            debug!("Lifecycle channel closed");
                            break;
                        };
                        reports.push(self.checkpoint(trigger).await);
                        if trigger == LifecycleTrigger::Terminate {
                            break;
                        }
                    }
                    _ = tick(&mut ticker) => {
                        if let Err(e) = self.manager.save().await {
                            warn!(error = %e, "Autosave failed");
                        }
                    }
                }
            }

            reports
        })
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
