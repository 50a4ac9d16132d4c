//! Fleetdrop CLI - Command-line interface
//!
//! Keeps a deployment bundle in sync with its remote source and serves it to
//! managed endpoints.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use fleetdrop::config::ConfigFile;
use fleetdrop::logging::init_logging;

use commands::config::ConfigCommands;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "fleetdrop", version, about = "Payload distribution for managed endpoint fleets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the `[payload]` section of config.ini.
#[derive(Debug, Clone, Default, Args)]
pub struct PayloadArgs {
    /// Payload short name (used for env overrides and the asset route)
    #[arg(long)]
    pub payload: Option<String>,

    /// Directory the artifact is published in
    #[arg(long)]
    pub asset_dir: Option<PathBuf>,

    /// Remote JSON config URL
    #[arg(long)]
    pub config_url: Option<String>,

    /// Static artifact download URL
    #[arg(long)]
    pub download_url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one acquisition cycle and report what happened
    Refresh {
        #[command(flatten)]
        payload: PayloadArgs,
    },

    /// Show the published artifact
    Info {
        #[command(flatten)]
        payload: PayloadArgs,

        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Recompute the hash even if the file looks unchanged
        #[arg(long)]
        rehash: bool,
    },

    /// Keep the artifact up to date and serve it over HTTP
    Serve {
        #[command(flatten)]
        payload: PayloadArgs,

        /// Listen address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Serve only; do not run the periodic refresh
        #[arg(long)]
        no_refresh: bool,
    },

    /// View or edit config.ini
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let command = match cli.command {
        Commands::Config { command } => return commands::config::run(command),
        other => other,
    };

    let config = ConfigFile::load()?;
    let _guard = init_logging(
        config.logging.directory.as_deref(),
        config.logging.filter.as_deref(),
    )?;

    match command {
        Commands::Refresh { payload } => commands::refresh::run(&config, &payload),
        Commands::Info {
            payload,
            json,
            rehash,
        } => commands::info::run(&config, &payload, json, rehash),
        Commands::Serve {
            payload,
            bind,
            no_refresh,
        } => commands::serve::run(
            &config,
            commands::serve::ServeArgs {
                payload,
                bind,
                no_refresh,
            },
        ),
        Commands::Config { .. } => Ok(()),
    }
}
