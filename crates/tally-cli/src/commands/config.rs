//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use tally_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.document_path().display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:               {}", config.data_dir.display());
            println!("  store_name:             {}", config.store_name);
            println!("  sync_url:               {}", or_unset(config.sync_url.as_deref()));
            println!("  sync_enabled:           {}", config.sync_enabled);
            println!(
                "  cloud_container_id:     {}",
                or_unset(config.cloud_container_id.as_deref())
            );
            println!("  checkpoint_grace_ms:    {}", config.checkpoint_grace_ms);
            println!(
                "  autosave_interval_secs: {}",
                config
                    .autosave_interval_secs
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!(
                "  log_file:               {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    config.set_value(&key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn or_unset(value: Option<&str>) -> &str {
    value.unwrap_or("(not set)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_writes_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set(
            "cloud_container_id".to_string(),
            "ledger".to_string(),
            Some(&path),
            &output,
        )
        .unwrap();
        set(
            "autosave_interval_secs".to_string(),
            "30".to_string(),
            Some(&path),
            &output,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.cloud_container_id.as_deref(), Some("ledger"));
        assert_eq!(config.autosave_interval_secs, Some(30));
    }

    #[test]
    fn test_set_rejects_unknown_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        assert!(set("favorite".to_string(), "x".to_string(), Some(&path), &output).is_err());
        assert!(!path.exists());
    }
}
