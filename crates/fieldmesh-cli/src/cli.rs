//! Clap CLI definitions for fieldmesh.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  fieldmesh coordinator --listen 0.0.0.0:5560
  fieldmesh agent --id rig-1 --parent 10.0.0.1:5560
  fieldmesh send --upstream 127.0.0.1:5560 --to rig-1 --key STATE --value '\"RUNNING\"'";

/// Fieldmesh: addressed, confirmed messaging across a tree of routers.
#[derive(Parser)]
#[command(name = "fieldmesh", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (defaults to ~/.fieldmesh/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the root router.
    Coordinator {
        /// Router id.
        #[arg(long)]
        id: Option<String>,
        /// Listener address.
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Directory FILE requests are served from.
        #[arg(long)]
        file_root: Option<PathBuf>,
    },
    /// Run an agent router beneath a parent.
    Agent {
        /// Router id.
        #[arg(long)]
        id: Option<String>,
        /// Listener address.
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Parent router address (`host:port`).
        #[arg(long)]
        parent: Option<String>,
        /// Parent router id.
        #[arg(long, default_value = "coordinator")]
        parent_id: String,
        /// Directory received files are saved to.
        #[arg(long)]
        file_root: Option<PathBuf>,
        /// Maximum CONTINUOUS relay rate per consumer.
        #[arg(long)]
        continuous_hz: Option<f64>,
    },
    /// Send one message through a router and wait for its confirmation.
    Send {
        /// Router to connect to (`host:port`).
        #[arg(long)]
        upstream: Option<String>,
        /// Id of that router.
        #[arg(long, default_value = "coordinator")]
        upstream_id: String,
        /// Recipient id, or a comma-separated explicit path (defaults to
        /// the upstream router).
        #[arg(long)]
        to: Option<String>,
        /// Message key.
        #[arg(long)]
        key: String,
        /// Value as JSON; anything that is not JSON is sent as a string.
        #[arg(long, default_value = "null")]
        value: String,
        /// Do not ask for a confirmation.
        #[arg(long)]
        no_repeat: bool,
        /// How long to wait for the confirmation, in milliseconds.
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
}
