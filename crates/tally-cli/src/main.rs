//! Tally CLI
//!
//! Command-line host for a Tally store: records, cloud sync and
//! lifecycle checkpoints.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use tally_core::Config;

mod commands;
mod output;

use commands::record::parse_field;
use commands::Session;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Tally - Local-first record store with cloud sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store and sync status
    Status,
    /// Sync with the cloud now
    Sync,
    /// Manage records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Turn cloud sync on or off (applies on next start)
    Cloud {
        #[command(subcommand)]
        command: CloudCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Keep the store open and checkpoint on process signals
    Run {
        /// Autosave period in seconds (0 disables)
        #[arg(long, value_name = "SECS")]
        autosave: Option<u64>,
    },
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Add a record
    Add {
        /// Record kind, e.g. "expense"
        kind: String,
        /// Field as key=value (repeatable)
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,
    },
    /// List records
    List {
        /// Only records of this kind
        #[arg(long)]
        kind: Option<String>,
        /// Only records whose field equals a value, as key=value (repeatable)
        #[arg(long = "where", value_parser = parse_field)]
        equals: Vec<(String, Value)>,
        /// Maximum number of records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show a record
    Show {
        /// Record ID (or unique prefix)
        id: String,
    },
    /// Change fields on a record
    Set {
        /// Record ID (or unique prefix)
        id: String,
        /// Field as key=value (repeatable)
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,
        /// Field to remove (repeatable)
        #[arg(long)]
        unset: Vec<String>,
    },
    /// Delete a record
    Rm {
        /// Record ID (or unique prefix)
        id: String,
    },
    /// Full-text search
    Search {
        /// Search query
        query: String,
    },
}

#[derive(Subcommand)]
enum CloudCommands {
    /// Request cloud sync
    Enable,
    /// Stop cloud sync
    Disable,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (see `tally config show`)
        key: String,
        /// Configuration value ("none" clears optional keys)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Commands that don't need the store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config, cli.verbose);

    let session = Session::open(config, config_path).await?;

    // The host manages its own checkpoints until a terminate signal
    if let Commands::Run { autosave } = cli.command {
        return commands::run::run(session, autosave, &output).await;
    }

    let result = match cli.command {
        Commands::Status => commands::status::show(&session, &output),
        Commands::Sync => commands::sync::sync(&session, &output).await,
        Commands::Record { command } => handle_record_command(command, &session, &output).await,
        Commands::Cloud { command } => {
            let enabled = matches!(command, CloudCommands::Enable);
            commands::cloud::toggle(&session, enabled, &output).await
        }
        Commands::Config { .. } | Commands::Run { .. } => unreachable!(), // Handled above
    };

    // Always checkpoint before exiting, even when the command failed
    session.close().await;

    result
}

async fn handle_record_command(
    command: RecordCommands,
    session: &Session,
    output: &Output,
) -> Result<()> {
    match command {
        RecordCommands::Add { kind, fields } => {
            commands::record::add(session, kind, fields, output).await
        }
        RecordCommands::List {
            kind,
            equals,
            limit,
        } => commands::record::list(session, kind, equals, limit, output),
        RecordCommands::Show { id } => commands::record::show(session, id, output),
        RecordCommands::Set { id, fields, unset } => {
            commands::record::set(session, id, fields, unset, output).await
        }
        RecordCommands::Rm { id } => commands::record::delete(session, id, output).await,
        RecordCommands::Search { query } => commands::record::search(session, query, output),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging
///
/// RUST_LOG wins when set; otherwise the level follows `-v`.
/// Logs go to `log_file` when configured, stderr otherwise.
fn init_logging(config: &Config, verbosity: u8) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("tally_core={},tally_cli={}", level, level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore error if already initialized
    let _ = match &config.log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder.with_ansi(false).with_writer(file).try_init(),
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                builder.with_writer(std::io::stderr).try_init()
            }
        },
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}
