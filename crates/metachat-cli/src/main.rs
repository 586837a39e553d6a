//! Metachat CLI: loads the config and runs, checks or initializes a bridge.

mod backends;
mod cli;
mod cmd;
mod config;

use crate::cli::{Cli, Commands};
use clap::Parser;
use metachat_types::config::MetachatConfig;
use std::path::Path;
use std::process::ExitCode;
use tracing::error;

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config, then install tracing with its log level.
fn load_with_tracing(path: &Path) -> Option<MetachatConfig> {
    match config::load_config(path) {
        Ok(config) => {
            init_tracing_stderr(&config.log_level);
            Some(config)
        }
        Err(e) => {
            init_tracing_stderr("info");
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            None
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Init => {
            init_tracing_stderr("info");
            if let Err(e) = cmd::init::cmd_init(&cli.config) {
                error!(error = %e, "Init failed");
                return ExitCode::FAILURE;
            }
        }
        Commands::Check => {
            let Some(config) = load_with_tracing(&cli.config) else {
                return ExitCode::FAILURE;
            };
            if let Err(e) = cmd::check::cmd_check(config) {
                error!(error = %e, "Configuration check failed");
                return ExitCode::FAILURE;
            }
        }
        Commands::Start => {
            let Some(config) = load_with_tracing(&cli.config) else {
                return ExitCode::FAILURE;
            };
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "Failed to create Tokio runtime");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = rt.block_on(cmd::start::cmd_start(config)) {
                error!(error = %e, "Bridge stopped with an error");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
