//! Cloud toggle handlers

use anyhow::{bail, Result};

use tally_core::ToggleError;

use crate::commands::Session;
use crate::output::{Output, OutputFormat};

/// Record the cloud-sync choice; it applies on the next start
pub async fn toggle(session: &Session, enabled: bool, output: &Output) -> Result<()> {
    let restart = match session.manager.toggle_cloud_sync(enabled).await {
        Ok(restart) => restart,
        Err(ToggleError::MissingContainer) => bail!(
            "No cloud container configured. Set one with:\n  \
             tally config set cloud_container_id <id>"
        ),
        Err(ToggleError::NoBackend) => bail!(
            "No sync server configured. Set one with:\n  \
             tally config set sync_url ws://your-server:3030"
        ),
        Err(e) => return Err(e.into()),
    };

    let state = if restart.cloud_sync_requested {
        "enabled"
    } else {
        "disabled"
    };

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "cloud_sync_requested": restart.cloud_sync_requested,
            "restart_required": true,
            "cloud_live": session.manager.is_cloud_enabled(),
        })),
        _ => {
            output.success(&format!("Cloud sync {}", state));
            output.message("Restart tally for the change to take effect.");
        }
    }

    Ok(())
}
