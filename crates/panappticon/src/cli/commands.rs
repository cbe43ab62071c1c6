//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Start collecting immediately instead of waiting for the hotkey
    #[arg(long)]
    pub collect: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Recent command arguments.
#[derive(Debug, Args)]
pub struct RecentCommand {
    /// Which table to read
    #[arg(value_enum, default_value = "keystrokes")]
    pub kind: CaptureKindArg,

    /// Maximum number of rows
    #[arg(short, long, default_value = "20")]
    pub limit: usize,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Shortcut command arguments.
#[derive(Debug, Args)]
pub struct ShortcutCommand {
    /// Shortcut text, e.g. `ctrl+opt+p`
    pub text: String,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Capture kind argument for selecting a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CaptureKindArg {
    /// Keystroke rows
    Keystrokes,
    /// Now-playing media rows
    Media,
    /// Screenshot rows
    Screenshots,
}

impl From<CaptureKindArg> for crate::capture::CaptureKind {
    fn from(arg: CaptureKindArg) -> Self {
        match arg {
            CaptureKindArg::Keystrokes => Self::Keystrokes,
            CaptureKindArg::Media => Self::Media,
            CaptureKindArg::Screenshots => Self::Screenshots,
        }
    }
}
