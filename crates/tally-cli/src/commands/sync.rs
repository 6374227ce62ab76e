//! Sync command handler

use anyhow::{bail, Result};

use tally_core::{SyncError, SyncOutcome};

use crate::commands::Session;
use crate::output::Output;

/// Sync with the cloud now
pub async fn sync(session: &Session, output: &Output) -> Result<()> {
    if session.manager.is_cloud_enabled() {
        output.message("Syncing...");
    }

    match session.manager.request_sync().await {
        Ok(SyncOutcome::Completed {
            remote_changes: true,
        }) => {
            output.success("Sync complete - store updated");
            output.message(&format!("  Records: {}", session.manager.count(None)?));
        }
        Ok(SyncOutcome::Completed {
            remote_changes: false,
        }) => output.success("Sync complete - already up to date"),
        Ok(SyncOutcome::Coalesced) => output.success("Sync already ran"),
        Err(SyncError::SyncDisabled) => {
            if session.config.sync_enabled {
                bail!(
                    "Cloud sync is off for this session. Check `tally status` for the reason."
                );
            }
            bail!(
                "Sync is not enabled. Enable it with:\n  \
                 tally config set sync_url ws://your-server:3030\n  \
                 tally config set cloud_container_id <id>\n  \
                 tally cloud enable"
            );
        }
        Err(SyncError::Failed(kind)) => bail!("Sync failed: {}", kind.user_message()),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
