use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI interface for the companion client.
#[derive(Parser, Debug)]
#[command(name = "keyferry", about = "Pair with a keyferry agent and send it secrets")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the credentials file written by `pair`.
    #[arg(long, global = true, env = "KEYFERRY_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Per-step network deadline in seconds.
    #[arg(long, global = true, default_value = "10", env = "KEYFERRY_TIMEOUT")]
    pub timeout: u64,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pair with an agent using the URI it printed.
    Pair {
        /// `keyferry://pair?...` URI.
        uri: String,
        /// Device id to register; the agent picks one when omitted.
        #[arg(long)]
        device_id: Option<String>,
        /// Let the agent generate the device key instead of proposing one.
        #[arg(long)]
        agent_key: bool,
    },
    /// Send a secret to be typed into the focused control.
    Send {
        /// Secret to send; read from stdin when omitted.
        secret: Option<String>,
    },
    /// Grant this device an approval window.
    Approve {
        /// Window length in seconds; the agent default when omitted.
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Open the agent's arm window.
    Arm {
        /// Window length in seconds; the agent default when omitted.
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Close the agent's arm window.
    Disarm,
}
