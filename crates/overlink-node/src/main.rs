mod cli;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use overlink_core::NodeIdentifier;
use overlink_logging::{LogConfig, NodeContextGuard, OverlinkSubscriberBuilder};
use overlink_node::{NodeConfig, OverlinkNode};
use overlink_uplink::{UplinkConfig, UplinkRelay};

use cli::{Cli, Command, parse_logical_node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            common,
            listen,
            logical_nodes,
            relay,
            namespace,
        } => {
            let mut config = common.node_config()?;
            if !listen.is_empty() {
                config.listen = listen;
            }
            config.relays.extend(relay);
            if namespace.is_some() {
                config.uplink.namespace = namespace;
            }
            config
                .logical_nodes
                .extend(logical_nodes.iter().map(|spec| parse_logical_node(spec)));
            run(config).await
        }

        Command::Echo {
            common,
            text,
            timeout_ms,
        } => {
            let mut config = common.node_config()?;
            // Only a client; never listens
            config.listen.clear();
            echo(config, &text, Duration::from_millis(timeout_ms)).await
        }

        Command::Relay {
            listen,
            name,
            log_level,
            pretty,
        } => {
            let mut logging = LogConfig {
                default_level: log_level,
                ..LogConfig::default()
            };
            logging.console.pretty = pretty;
            relay(&listen, name, logging).await
        }
    }
}

async fn relay(listen: &str, name: String, logging: LogConfig) -> anyhow::Result<()> {
    let _log_guard = OverlinkSubscriberBuilder::new()
        .with_config(logging)
        .with_node_name(name.clone())
        .try_init()?;

    let relay = UplinkRelay::new(name, UplinkConfig::default());
    let address = relay
        .listen(listen)
        .await
        .with_context(|| format!("listening on {listen}"))?;
    println!("relay listening on uplink:{address}");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!(sessions = relay.session_count(), "Ctrl-C received");
    relay.shutdown();
    Ok(())
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let _log_guard = OverlinkSubscriberBuilder::new()
        .with_config(config.logging.clone())
        .with_node_name(config.display_name.clone())
        .try_init()?;

    let node = OverlinkNode::new(config)?;
    let _context = NodeContextGuard::new(node.session_id());
    let endpoints = node.start().await?;

    println!("{} {}", node.display_name(), node.session_id());
    for endpoint in &endpoints {
        println!("listening on {endpoint}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!(node = %node.session_id().short_id(), "Ctrl-C received");
    node.shutdown().await;
    Ok(())
}

async fn echo(config: NodeConfig, text: &str, timeout: Duration) -> anyhow::Result<()> {
    let _log_guard = OverlinkSubscriberBuilder::new()
        .with_config(config.logging.clone())
        .with_node_name(config.display_name.clone())
        .try_init()?;

    let peers = config.connect_points()?;
    let Some(peer) = peers.first() else {
        anyhow::bail!("echo needs a node to connect to (--connect)");
    };
    let config = NodeConfig {
        connect: Vec::new(),
        ..config
    };

    let node = OverlinkNode::new(config.with_rpc_timeout(timeout))?;
    let _context = NodeContextGuard::new(node.session_id());
    node.start().await?;

    let channel = node
        .connect(peer)
        .await
        .with_context(|| format!("connecting to {peer}"))?;
    let target = channel.remote_node_id().default_logical_node_id();

    let started = tokio::time::Instant::now();
    let result = node.echo_proxy(target).echo(text).await;
    node.shutdown().await;

    let reply = result.context("echo call failed")?;
    println!(
        "{} replied {:?} in {} ms",
        channel.remote_display_name(),
        reply,
        started.elapsed().as_millis()
    );
    Ok(())
}
