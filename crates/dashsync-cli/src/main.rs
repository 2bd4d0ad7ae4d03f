//! dashsync CLI
//!
//! Command-line client for a dashsync server: watch live entity updates,
//! push changes (queued offline when the server is unreachable), and inspect
//! local sync state.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dashsync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "dashsync")]
#[command(about = "dashsync - Real-time dashboard sync client")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to config file (overrides DASHSYNC_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to a data type and print updates as they arrive
    Watch {
        /// Data type to watch (e.g. task, project)
        kind: String,
        /// Subscription filter as key=value (repeatable)
        #[arg(short, long = "filter", value_name = "KEY=VALUE")]
        filter: Vec<String>,
        /// Exit after this many updates
        #[arg(long)]
        count: Option<usize>,
    },
    /// Send a change to the server, queueing it if offline
    Push {
        /// Change type (e.g. task_update)
        change_type: String,
        /// Change payload as a JSON object
        data: String,
    },
    /// Show local sync state
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (server_url, token, data_dir, log_file, log_level, sync.*)
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

    // Config commands must work even when the file is broken
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(&config, cli.log_level.as_deref());

    match cli.command {
        Commands::Watch {
            kind,
            filter,
            count,
        } => commands::watch::run(&config, kind, filter, count, &output).await,
        Commands::Push { change_type, data } => {
            commands::push::run(&config, change_type, data, &output).await
        }
        Commands::Status => commands::status::show(&config, &output),
        Commands::Config { .. } => Ok(()),
    }
}

/// Initialize logging.
///
/// Level comes from `--log-level`, then `log_level` in config (which
/// `DASHSYNC_LOG` overrides), then `warn`. Logs go to `log_file` when set,
/// otherwise to stderr.
fn init_logging(config: &Config, cli_level: Option<&str>) {
    let level = cli_level
        .or(config.log_level.as_deref())
        .unwrap_or("warn");
    let env_filter = EnvFilter::new(format!("dashsync_core={},dashsync_cli={}", level, level));

    if let Some(ref log_path) = config.log_file {
        let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
                return;
            }
        };
        // Ignore error if already initialized
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(log_file)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
