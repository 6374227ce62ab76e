//! Long-running host
//!
//! Keeps the store open and maps process signals onto lifecycle
//! checkpoints:
//!
//! - SIGINT / SIGTERM: terminate (final save, then exit)
//! - SIGTSTP: background entry (the host keeps running)
//! - SIGHUP: foreground loss
//!
//! On other platforms only Ctrl+C is handled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

use tally_core::{LifecycleTrigger, SyncDispatch, SyncNotification, SyncStatus};

use crate::commands::Session;
use crate::output::{Output, OutputFormat};

/// Run until a terminate signal arrives
pub async fn run(session: Session, autosave: Option<u64>, output: &Output) -> Result<()> {
    let autosave = match autosave {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => session.config.autosave_interval(),
    };

    let (tx, rx) = mpsc::channel(8);
    let checkpoints = Arc::clone(&session.checkpointer).spawn(rx, autosave);
    let watcher = tokio::spawn(watch_sync(
        session.manager.subscribe_status(),
        session.manager.subscribe_notifications(),
        output.format,
    ));

    output.message(&format!(
        "Store open ({}), cloud sync {}. Press Ctrl+C to stop.",
        session.manager.current_status(),
        if session.manager.is_cloud_enabled() {
            "on"
        } else {
            "off"
        }
    ));
    info!(autosave_secs = autosave.map(|d| d.as_secs()), "Host running");

    forward_signals(tx).await?;

    let reports = checkpoints.await.context("Checkpoint task failed")?;
    watcher.abort();

    for report in &reports {
        debug!(
            trigger = %report.event.trigger,
            saved = report.saved,
            sync = ?report.sync,
            "Checkpoint"
        );
    }
    match reports.last() {
        Some(report) if report.event.trigger == LifecycleTrigger::Terminate => {
            if !report.saved {
                output.warn("Store was not saved on exit");
            }
            if let SyncDispatch::Failed(kind) = &report.sync {
                output.warn(&format!("Final sync failed: {}", kind.user_message()));
            }
        }
        // Channel closed without a terminate checkpoint
        _ => {
            session.close().await;
        }
    }

    output.message("Stopped.");
    Ok(())
}

#[cfg(target_os = "linux")]
const SIGTSTP: i32 = 20;
#[cfg(all(unix, not(target_os = "linux")))]
const SIGTSTP: i32 = 18;

#[cfg(unix)]
async fn forward_signals(tx: mpsc::Sender<LifecycleTrigger>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigtstp =
        signal(SignalKind::from_raw(SIGTSTP)).context("Failed to install SIGTSTP handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    loop {
        let trigger = tokio::select! {
            _ = sigint.recv() => LifecycleTrigger::Terminate,
            _ = sigterm.recv() => LifecycleTrigger::Terminate,
            _ = sigtstp.recv() => LifecycleTrigger::BackgroundEntry,
            _ = sighup.recv() => LifecycleTrigger::ForegroundLoss,
        };

        info!(%trigger, "Lifecycle signal received");
        if tx.send(trigger).await.is_err() {
            break;
        }
        if trigger == LifecycleTrigger::Terminate {
            break;
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn forward_signals(tx: mpsc::Sender<LifecycleTrigger>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Lifecycle signal received");
    let _ = tx.send(LifecycleTrigger::Terminate).await;
    Ok(())
}

/// Print status changes and sync notifications as they happen
async fn watch_sync(
    mut status: watch::Receiver<SyncStatus>,
    mut notifications: broadcast::Receiver<SyncNotification>,
    format: OutputFormat,
) {
    let output = Output::new(format);
    let mut status_open = true;

    loop {
        tokio::select! {
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let current = status.borrow_and_update().clone();
                match output.format {
                    OutputFormat::Json => output.json(&serde_json::json!({ "status": current })),
                    _ => output.message(&format!("Sync status: {}", current)),
                }
            }
            notification = notifications.recv() => match notification {
                Ok(SyncNotification::Completed { at }) => {
                    output.message(&format!("Synced at {}", at.format("%H:%M:%S")));
                }
                Ok(SyncNotification::Failed(kind)) => {
                    output.warn(&format!("Sync failed: {}", kind.user_message()));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
