//! Status command handler

use anyhow::Result;

use tally_core::SyncStatus;

use crate::commands::Session;
use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(session: &Session, output: &Output) -> Result<()> {
    let manager = &session.manager;
    let config = &session.config;
    let status = manager.current_status();
    let descriptor = manager.descriptor();
    let stats = manager.storage_stats().unwrap_or_default();
    let records = manager.count(None)?;

    match output.format {
        OutputFormat::Json => {
            output.json(&serde_json::json!({
                "status": status,
                "cloud_live": manager.is_cloud_enabled(),
                "store": descriptor.as_ref().map(|d| serde_json::json!({
                    "name": d.name,
                    "file_path": d.file_path,
                    "cloud_enabled": d.cloud_enabled,
                    "cloud_container_id": d.cloud_container_id,
                })),
                "sync_url": config.sync_url,
                "storage": stats,
                "records": records,
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", status);
        }
        OutputFormat::Human => {
            println!("Tally Status");
            println!("============");
            println!();
            if let Some(descriptor) = &descriptor {
                println!("Store:");
                println!("  Name: {}", descriptor.name);
                println!("  File: {}", descriptor.file_path.display());
                println!();
            }
            println!("Sync:");
            println!("  Status: {}", status);
            if let Some(message) = error_message(&status) {
                println!("          {}", message);
            }
            println!(
                "  Cloud:  {}",
                if manager.is_cloud_enabled() {
                    "on"
                } else if config.sync_enabled {
                    "requested, off for this session"
                } else {
                    "off"
                }
            );
            if let Some(ref url) = config.sync_url {
                println!("  Server: {}", url);
            }
            if let Some(container) = descriptor.as_ref().and_then(|d| d.cloud_container_id.as_ref()) {
                println!("  Container: {}", container);
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!("  Size:     {}", stats.total_size_human());
            println!("  Records:  {}", records);
        }
    }

    Ok(())
}

fn error_message(status: &SyncStatus) -> Option<String> {
    match status {
        SyncStatus::Error(kind) => Some(kind.user_message()),
        _ => None,
    }
}
