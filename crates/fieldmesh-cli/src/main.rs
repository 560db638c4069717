//! Fieldmesh CLI: run a coordinator or an agent router, or send a single
//! message through one.

mod cli;
mod config;

use crate::cli::{Cli, Commands};
use clap::Parser;
use fieldmesh_types::{Address, NodeConfig, RouterConfig, UpstreamConfig, Value};
use fieldmesh_wire::{Agent, Coordinator, Listens, Node, RouteTable, SendOptions, WireResult};
use std::time::{Duration, Instant};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = config::load_config(cli.config.as_deref());
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start the async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async {
        match cli.command {
            Commands::Coordinator {
                id,
                listen,
                file_root,
            } => {
                let mut config = file.router;
                config.parent = None;
                apply_router_flags(&mut config, id, listen, file_root);
                cmd_coordinator(config).await
            }
            Commands::Agent {
                id,
                listen,
                parent,
                parent_id,
                file_root,
                continuous_hz,
            } => {
                let mut config = file.router;
                apply_router_flags(&mut config, id, listen, file_root);
                if let Some(addr) = parent {
                    config.parent = Some(UpstreamConfig {
                        id: parent_id,
                        addr,
                    });
                }
                if continuous_hz.is_some() {
                    config.continuous_hz = continuous_hz;
                }
                cmd_agent(config).await
            }
            Commands::Send {
                upstream,
                upstream_id,
                to,
                key,
                value,
                no_repeat,
                wait_ms,
            } => {
                let mut config = file.node;
                if let Some(addr) = upstream {
                    config.upstream = Some(UpstreamConfig {
                        id: upstream_id,
                        addr,
                    });
                }
                let opts = if no_repeat {
                    SendOptions::no_repeat()
                } else {
                    SendOptions::default()
                };
                cmd_send(config, to, &key, parse_value(&value), opts, Duration::from_millis(wait_ms)).await
            }
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn apply_router_flags(
    config: &mut RouterConfig,
    id: Option<String>,
    listen: Option<std::net::SocketAddr>,
    file_root: Option<std::path::PathBuf>,
) {
    if let Some(id) = id {
        config.id = id;
    }
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if file_root.is_some() {
        config.file_root = file_root;
    }
}

/// A single id, or a comma-separated explicit path such as `rig-1,leaf`.
fn parse_address(raw: &str) -> Address {
    if raw.contains(',') {
        Address::from(raw.split(',').map(|hop| hop.trim().to_string()).collect::<Vec<_>>())
    } else {
        Address::from(raw)
    }
}

/// JSON if it parses, a plain string otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|json| Value::from_json(json, true).ok())
        .unwrap_or_else(|| Value::from(raw))
}

async fn cmd_coordinator(config: RouterConfig) -> WireResult<()> {
    let coordinator = Coordinator::start(config, RouteTable::new()).await?;
    tracing::info!(
        id = %coordinator.router().id(),
        addr = %coordinator.router().local_addr(),
        "Coordinator running, Ctrl+C to stop"
    );
    tokio::select! {
        _ = tokio::signal::ctrl_c() => coordinator.release(),
        _ = coordinator.closed() => {}
    }
    Ok(())
}

async fn cmd_agent(config: RouterConfig) -> WireResult<()> {
    let agent = Agent::start(config, RouteTable::new()).await?;
    tracing::info!(
        id = %agent.router().id(),
        addr = %agent.router().local_addr(),
        parent = ?agent.router().parent_id(),
        "Agent running, Ctrl+C to stop"
    );
    tokio::select! {
        _ = tokio::signal::ctrl_c() => agent.release(),
        _ = agent.closed() => {}
    }
    Ok(())
}

async fn cmd_send(
    config: NodeConfig,
    to: Option<String>,
    key: &str,
    value: Value,
    opts: SendOptions,
    wait: Duration,
) -> WireResult<()> {
    let node = Node::start(config, Listens::new()).await?;
    let repeat = opts.repeat;
    let Some(id) = node.send_opts(to.as_deref().map(parse_address), key, value, opts) else {
        node.release();
        return Err(fieldmesh_wire::WireError::Config("message could not be sent".into()));
    };

    if repeat {
        let deadline = Instant::now() + wait;
        while node.pending().contains(&id) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if node.pending().contains(&id) {
            println!("{id} sent, not confirmed within {} ms", wait.as_millis());
        } else {
            println!("{id} confirmed");
        }
    } else {
        // Give the writer task a moment to flush before the channel closes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        println!("{id} sent");
    }
    node.release();
    Ok(())
}
