//! cloudsync CLI
//!
//! Command-line host for the cloud sync engine: manages the local store
//! directory and runs manual or automatic sync against the sync API.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cloudsync_core::sync::wire::QuotaDelta;
use cloudsync_core::Config;

mod commands;
mod engine;
mod output;

use commands::account::KeyAction;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "cloudsync")]
#[command(about = "cloudsync - sync local JSON stores with a cloud operation log")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize cloudsync (data directory and device id)
    Init,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Turn cloud sync on
    Enable,
    /// Turn cloud sync off
    Disable,
    /// Show sync status
    Status,
    /// Manage local stores
    Store {
        #[command(subcommand)]
        command: StoreCommands,
    },
    /// Pull, then push every store once
    Sync,
    /// Run automatic sync until interrupted
    Run,
    /// Show account quotas
    Quotas {
        /// Validate a storage size change (bytes) instead of listing quotas
        #[arg(long, allow_hyphen_values = true)]
        storage_delta: Option<i64>,
        /// Validate an object count change
        #[arg(long, allow_hyphen_values = true)]
        objects_delta: Option<i64>,
    },
    /// Register or rotate encryption keys
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, api_base_url, device_id, log_file, sync.<setting>)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// List store names
    #[command(alias = "ls")]
    List,
    /// Print a store's value
    Get {
        /// Store name (e.g. settings, plugin:clipboard:history)
        name: String,
    },
    /// Write a store's value
    Set {
        /// Store name
        name: String,
        /// JSON value (plain text is stored as a string)
        value: String,
    },
    /// Remove a store
    #[command(alias = "rm")]
    Remove {
        /// Store name
        name: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Register a key
    Register {
        /// JSON request body
        body: String,
    },
    /// Rotate a key
    Rotate {
        /// JSON request body
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.clone().unwrap_or_else(Config::config_file_path);

    // Commands that manage the config file itself
    match &cli.command {
        Commands::Config { command } => {
            return handle_config_command(command.clone(), &config_path, &output);
        }
        Commands::Init => return commands::init::init(&config_path, &output),
        _ => {}
    }

    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Config { .. } | Commands::Init => unreachable!(), // Handled above
        Commands::Enable => commands::status::enable(&config, &output),
        Commands::Disable => commands::status::disable(&config, &output),
        Commands::Status => commands::status::show(&config, &output),
        Commands::Store { command } => handle_store_command(command, &config, &output),
        Commands::Sync => commands::sync::sync(&config, &output).await,
        Commands::Run => commands::sync::run(&config, &output).await,
        Commands::Quotas {
            storage_delta,
            objects_delta,
        } => {
            let delta = (storage_delta.is_some() || objects_delta.is_some()).then(|| QuotaDelta {
                storage_bytes_delta: storage_delta.unwrap_or(0),
                objects_delta: objects_delta.unwrap_or(0),
            });
            commands::account::quotas(&config, delta, &output).await
        }
        Commands::Keys { command } => {
            let (action, body) = match command {
                KeyCommands::Register { body } => (KeyAction::Register, body),
                KeyCommands::Rotate { body } => (KeyAction::Rotate, body),
            };
            commands::account::keys(&config, action, &body, &output).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: &Path,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

fn handle_store_command(command: StoreCommands, config: &Config, output: &Output) -> Result<()> {
    match command {
        StoreCommands::List => commands::store::list(config, output),
        StoreCommands::Get { name } => commands::store::get(config, &name, output),
        StoreCommands::Set { name, value } => commands::store::set(config, &name, &value, output),
        StoreCommands::Remove { name } => commands::store::remove(config, &name, output),
    }
}

/// Initialize logging
///
/// `RUST_LOG` wins when set. Logs go to `log_file` when configured (appended,
/// no colors), otherwise to stderr.
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("cloudsync_core={},cloudsync={}", level, level))
    });

    if let Some(ref log_path) = config.log_file {
        match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(file) => {
                // Ignore error if already initialized
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(file)
                    .try_init();
                return;
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            }
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
