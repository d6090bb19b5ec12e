//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - init: set up replication for a freshly imported database
//! - check: query the replication service without applying anything
//! - update: run the update loop

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// georepl - keep a geospatial database current from a replication service
#[derive(Parser, Debug)]
#[command(name = "georepl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Options shared by every command that talks to the replication service
#[derive(Args, Debug, Clone, Default)]
pub struct NetworkArgs {
    /// Timeout in seconds for requests to the replication service
    #[arg(long, value_name = "SECONDS")]
    pub socket_timeout: Option<u64>,
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialise replication from the date of the imported data
    Init {
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// Check whether new updates are available
    Check {
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// Download and apply updates
    Update(UpdateArgs),
}

/// Arguments of the update command
#[derive(Args, Debug, Clone, Default)]
pub struct UpdateArgs {
    /// Download and apply updates only once
    #[arg(long)]
    pub once: bool,

    /// Do not index the new data (only with --once)
    #[arg(long)]
    pub no_index: bool,

    /// Cache size of the import tool in MB
    #[arg(long, value_name = "MB")]
    pub import_cache: Option<u32>,

    /// Number of worker threads for importing and indexing
    #[arg(long)]
    pub threads: Option<usize>,

    #[command(flatten)]
    pub network: NetworkArgs,
}
