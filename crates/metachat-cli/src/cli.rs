//! Clap CLI definitions for Metachat.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  metachat init                 Write a starter metachat.toml
  metachat check                Validate config, backends and rooms
  metachat start                Run the bridge

Secrets are read from the environment variables named in the config.
Set RUST_LOG to override the configured log level.";

/// Metachat relays messages between chats on different platforms.
#[derive(Parser)]
#[command(name = "metachat", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true, default_value = "metachat.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the bridge (default).
    Start,
    /// Load the config and build backends and rooms without starting anything.
    Check,
    /// Write a commented starter config. Never overwrites an existing file.
    Init,
}
