use std::{io::IsTerminal, time::Duration};

use clap::{Parser, Subcommand};
use leasehold_core::{
    client::{ControllerConfig, DEFAULT_URL},
    server::{ServerConfig, DEFAULT_MAX_BODY},
};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "leasehold")]
#[command(bin_name = "leasehold")]
pub struct Cli {
    #[arg(long, env)]
    pub no_ui: bool,

    #[command(subcommand)]
    pub commands: Commands,
}

impl Cli {
    pub fn no_ui(&self) -> bool {
        self.no_ui || !std::io::stdout().is_terminal()
    }

    pub fn version(&self) -> bool {
        matches!(self.commands, Commands::Version)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the lease server
    Serve {
        #[arg(long, short = 'p', env = "PORT")]
        port: u16,

        #[arg(long, env = "LEASEHOLD_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Lease TTL in milliseconds
        #[arg(long = "ttl", env = "LEASEHOLD_TTL", default_value_t = 15_000)]
        ttl_ms: u64,

        /// Largest accepted request body in bytes
        #[arg(long = "max-body", env = "LEASEHOLD_MAX_BODY", default_value_t = DEFAULT_MAX_BODY)]
        max_body: usize,
    },

    /// Acquire a lease, then run COMMAND (or wait for ctrl-c) and release it
    Acquire {
        name: String,

        #[arg(long, env = "LEASEHOLD_URL", default_value = DEFAULT_URL)]
        url: String,

        #[arg(long)]
        owner: Option<String>,

        /// How long to wait for the lease, in milliseconds
        #[arg(long = "timeout", short = 't', default_value_t = 20_000)]
        timeout_ms: u64,

        /// JSON handed to waiters on release
        #[arg(long, value_parser = parse_json)]
        payload: Option<Value>,

        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Print the server's lease table and counters
    Status {
        #[arg(long, env = "LEASEHOLD_URL", default_value = DEFAULT_URL)]
        url: String,
    },

    Version,
}

impl Commands {
    pub fn server_config(&self) -> Option<ServerConfig> {
        match self {
            Commands::Serve {
                ttl_ms, max_body, ..
            } => Some(ServerConfig {
                ttl: Duration::from_millis(*ttl_ms),
                max_body: *max_body,
            }),
            _ => None,
        }
    }

    pub fn controller_config(&self) -> Option<ControllerConfig> {
        match self {
            Commands::Acquire {
                url, timeout_ms, ..
            } => Some(ControllerConfig {
                url: url.to_owned(),
                acquire_timeout: Duration::from_millis(*timeout_ms),
            }),
            Commands::Status { url } => Some(ControllerConfig {
                url: url.to_owned(),
                ..Default::default()
            }),
            _ => None,
        }
    }
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
}
