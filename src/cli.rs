use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "copilot-chat-monitor",
    version,
    about = "Follow GitHub Copilot Chat sessions and request logs across VS Code installs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan once and print a summary of sessions and requests.
    Status,
    /// Check discovered storage roots and configuration.
    Doctor,
    /// Backfill and follow one extension log, by default the current window's.
    Follow {
        /// Log file to follow instead of the most recently written one.
        path: Option<PathBuf>,
    },
}
