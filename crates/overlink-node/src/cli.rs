//! Command line of the `overlink-node` binary

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use overlink_node::{NodeConfig, NodeResult};

#[derive(Parser, Debug)]
#[command(name = "overlink-node", version, about = "Overlink overlay node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen and connect as configured, run until Ctrl-C
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Contact point to listen on, e.g. direct:0.0.0.0:9000
        #[arg(short, long)]
        listen: Vec<String>,

        /// Logical node to announce as PART=cap1,cap2
        #[arg(long = "logical-node", value_name = "PART=CAPS")]
        logical_nodes: Vec<String>,

        /// Uplink relay to stay attached to, e.g. uplink:relay.example:7000
        #[arg(long)]
        relay: Vec<String>,

        /// Namespace under which relays forward channels to this node
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Run an uplink relay forwarding channels between its clients
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:7000")]
        listen: String,

        /// Name announced to clients
        #[arg(short, long, default_value = "overlink-relay")]
        name: String,

        /// Log level, overridden by RUST_LOG
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Human readable log output instead of JSON lines
        #[arg(long)]
        pretty: bool,
    },

    /// Connect to a node, call its echo service once and exit
    Echo {
        #[command(flatten)]
        common: CommonArgs,

        /// Text to send
        #[arg(short, long, default_value = "hello")]
        text: String,

        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Name announced to other nodes
    #[arg(short, long)]
    pub name: Option<String>,

    /// Contact point to connect to, e.g. direct:10.0.0.7:9000
    #[arg(short = 'C', long)]
    pub connect: Vec<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    pub log_level: Option<String>,

    /// Human readable log output instead of JSON lines
    #[arg(long)]
    pub pretty: bool,
}

impl CommonArgs {
    /// Configuration file (or defaults) with the flags applied
    pub fn node_config(&self) -> NodeResult<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };
        if let Some(name) = &self.name {
            config.display_name = name.clone();
        }
        if !self.connect.is_empty() {
            config.connect = self.connect.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.default_level = level.clone();
        }
        if self.pretty {
            config.logging.console.pretty = true;
        }
        Ok(config)
    }
}

/// Parse `PART=cap1,cap2` (capabilities optional)
pub fn parse_logical_node(spec: &str) -> overlink_node::LogicalNodeConfig {
    let (part, caps) = spec.split_once('=').unwrap_or((spec, ""));
    overlink_node::LogicalNodeConfig {
        logical_part: part.trim().to_string(),
        display_name: String::new(),
        capabilities: caps
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect(),
    }
}
