//! Clap CLI definitions for the host agent.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  hostagent run                                Start the agent on this host
  hostagent call get_health                    Call a method on the running agent
  hostagent call route_request 1 list_agents '{}'
  hostagent manage tcp://10.0.0.9:22916 volttron.central
  hostagent pubkey                             Print this host's public key";

/// Host agent: control-plane agent for a managed host.
#[derive(Parser)]
#[command(name = "hostagent", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent until interrupted.
    Run,
    /// Call an RPC method on a running agent.
    Call {
        /// Method name.
        method: String,
        /// Positional arguments. Each is parsed as JSON, falling back to a
        /// plain string.
        args: Vec<String>,
        /// Keyword arguments as a JSON object.
        #[arg(long)]
        kwargs: Option<String>,
        /// Node address. Defaults to the configured `vip_address`.
        #[arg(long)]
        address: Option<String>,
        /// Target identity. Defaults to the configured `identity`.
        #[arg(long)]
        peer: Option<String>,
    },
    /// Register a manager with the running agent.
    Manage {
        /// VIP address of the manager's platform.
        address: String,
        /// Identity of the manager agent.
        identity: String,
    },
    /// Print this host's public key, creating the keystore if needed.
    Pubkey,
}
