//! Command-line interface for Canopy.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Canopy - namespace metadata master with asynchronous persistence to under storage.
#[derive(Parser)]
#[command(name = "canopy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANOPY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "CANOPY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a namespace master
    Server {
        /// Under storage URI of the root mount
        #[arg(long, env = "CANOPY_ROOT_UFS")]
        root_ufs: Option<String>,

        /// Journal file
        #[arg(long, env = "CANOPY_JOURNAL")]
        journal: Option<PathBuf>,

        /// Emit logs as JSON
        #[arg(long)]
        json_logs: bool,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Show version information
    Version,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
