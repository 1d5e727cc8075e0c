//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - serve: run the multi-client server on a Unix socket
//! - launch: forward arguments to a running server
//! - pid: ask a running server for its process id

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// chanipc - channel-based IPC over Unix sockets
#[derive(Parser, Debug)]
#[command(name = "chanipc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the socket path from the config
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

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

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the launch channel until interrupted
    Serve,

    /// Forward arguments to the running server's launch channel
    Launch {
        /// Client id announced to the server
        #[arg(long)]
        id: Option<String>,

        /// Arguments to forward
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the running server's process id
    Pid {
        /// Client id announced to the server
        #[arg(long)]
        id: Option<String>,
    },
}
