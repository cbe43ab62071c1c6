//! Command-line interface for panappticon.
//!
//! This module provides the CLI structure for the `panappticon` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    CaptureKindArg, ConfigCommand, RecentCommand, RunCommand, ShortcutCommand, StatusCommand,
};

/// panappticon - Encrypted background capture agent
///
/// Records keystrokes, now-playing media and periodic screenshots into an
/// encrypted database and an encrypted disk image. Collection is switched
/// on and off with a global hotkey.
#[derive(Debug, Parser)]
#[command(name = "panappticon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the capture agent in the foreground
    Run(RunCommand),

    /// Show paths, mount state and collector settings
    Status(StatusCommand),

    /// Show the most recent captured rows
    Recent(RecentCommand),

    /// View or check configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Parse a shortcut and show how it is displayed
    Shortcut(ShortcutCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }

    /// The configuration file to use.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::config::Config::default_config_path)
    }
}
