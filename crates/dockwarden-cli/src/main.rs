//! dockwarden CLI - watch and manage container engines on remote nodes.
//!
//! This is the entry point for the `dockwarden` binary.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dockwarden_core::{CanonicalEvent, NodeId, Notification};
use dockwarden_node::{Fleet, NodeConnection, RecreateOptions};
use dockwarden_transport::SshConnector;
use futures::future::join_all;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::FleetFile;

/// dockwarden - container engines on remote nodes.
#[derive(Parser, Debug)]
#[command(name = "dockwarden")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fleet file listing nodes and credentials.
    #[arg(long, short, env = "DOCKWARDEN_CONFIG", default_value = "dockwarden.toml")]
    config: PathBuf,

    /// How long one-shot commands wait for a node to connect, in seconds.
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every node and print notifications as JSON lines until Ctrl-C.
    Watch {
        /// Print canonical events before debounce instead of notifications.
        #[arg(long)]
        raw: bool,
    },
    /// Show connection state of every node.
    Status,
    /// List containers on a node.
    Ps {
        /// Node ID.
        node: String,
        /// Include stopped containers.
        #[arg(long, short)]
        all: bool,
    },
    /// Print container logs.
    Logs {
        /// Node ID.
        node: String,
        /// Container name or ID.
        container: String,
        /// Only the last N lines.
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Run a command inside a container.
    Exec {
        /// Node ID.
        node: String,
        /// Container name or ID.
        container: String,
        /// Command and arguments.
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Recreate a container, rolling back on failure.
    Recreate {
        /// Node ID.
        node: String,
        /// Container name or ID.
        container: String,
        /// Replacement image.
        #[arg(long)]
        image: Option<String>,
        /// Pull the image before stopping the container.
        #[arg(long)]
        pull: bool,
        /// Environment override, `KEY=VALUE`. May be repeated.
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dockwarden=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let file = FleetFile::load(&args.config)?;
    let connector = Arc::new(SshConnector::new(file.settings.transport.clone()));
    let fleet = Fleet::new(connector, file.settings.clone());
    for node in &file.nodes {
        let credential = file.credential_for(node)?;
        fleet.register(node.clone(), credential)?;
    }
    tracing::debug!(nodes = file.nodes.len(), config = %args.config.display(), "Fleet loaded");

    let timeout = Duration::from_secs(args.connect_timeout);
    let result = run(&fleet, args.command, timeout).await;
    fleet.disconnect_all().await;
    result
}

async fn run(fleet: &Fleet, command: Command, timeout: Duration) -> anyhow::Result<()> {
    match command {
        Command::Watch { raw } => watch(fleet, raw).await,
        Command::Status => status(fleet, timeout).await,
        Command::Ps { node, all } => {
            let node = connect(fleet, &node, timeout).await?;
            let containers = node.list_containers(all).await?;
            println!("{:<14} {:<28} {:<32} {:<11} STATUS", "ID", "NAME", "IMAGE", "STATE");
            for c in containers {
                println!(
                    "{:<14} {:<28} {:<32} {:<11} {}",
                    c.id.short(),
                    c.name(),
                    c.image,
                    c.state.as_str(),
                    c.status
                );
            }
            Ok(())
        }
        Command::Logs {
            node,
            container,
            tail,
        } => {
            let node = connect(fleet, &node, timeout).await?;
            print!("{}", node.logs(&container, tail).await?);
            Ok(())
        }
        Command::Exec {
            node,
            container,
            cmd,
        } => {
            let node = connect(fleet, &node, timeout).await?;
            let output = node.exec_in_container(&container, &cmd).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            match output.exit_code {
                Some(0) | None => Ok(()),
                Some(code) => bail!("command exited with status {code}"),
            }
        }
        Command::Recreate {
            node,
            container,
            image,
            pull,
            env,
        } => {
            let node = connect(fleet, &node, timeout).await?;
            let options = RecreateOptions {
                env: env.into_iter().collect(),
                image,
                pull,
                stop_timeout: None,
            };
            let result = node.recreate(&container, &options).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.requires_manual_intervention() {
                bail!("rollback failed, manual intervention required");
            }
            if !result.success {
                bail!("recreate failed and was rolled back");
            }
            Ok(())
        }
    }
}

async fn connect(fleet: &Fleet, id: &str, timeout: Duration) -> anyhow::Result<Arc<NodeConnection>> {
    let id: NodeId = id.parse().with_context(|| format!("invalid node id {id:?}"))?;
    let node = fleet.get(&id)?;
    tokio::time::timeout(timeout, node.connect())
        .await
        .with_context(|| format!("timed out connecting to {id}"))??;
    Ok(node)
}

async fn watch(fleet: &Fleet, raw: bool) -> anyhow::Result<()> {
    let subscription = if raw {
        fleet.on_raw_event(print_json::<CanonicalEvent>)
    } else {
        fleet.on_event(print_json::<Notification>)
    };
    fleet.connect_all();
    tracing::info!("Watching, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    subscription.unsubscribe();
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
    }
}

async fn status(fleet: &Fleet, timeout: Duration) -> anyhow::Result<()> {
    let nodes = fleet.nodes();
    let attempts = nodes.iter().map(|node| async move {
        let connected = tokio::time::timeout(timeout, node.connect()).await;
        let containers = match connected {
            Ok(Ok(())) => node.list_containers(true).await.ok().map(|c| c.len()),
            _ => None,
        };
        (Arc::clone(node), containers)
    });
    let results = join_all(attempts).await;

    println!("{:<20} {:<24} {:<13} {:<11} {:<9} CONTAINERS", "NODE", "NAME", "STATUS", "MODE", "DEGRADED");
    for (node, containers) in results {
        let state = node.state();
        println!(
            "{:<20} {:<24} {:<13} {:<11} {:<9} {}",
            node.id().as_str(),
            node.descriptor().name,
            state.status.as_str(),
            state.transport_mode.as_str(),
            state.degraded,
            containers.map_or_else(|| "-".to_string(), |n| n.to_string())
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs() {
        assert_eq!(parse_env("A=1"), Ok(("A".into(), "1".into())));
        assert_eq!(parse_env("A=b=c"), Ok(("A".into(), "b=c".into())));
        assert_eq!(parse_env("A="), Ok(("A".into(), String::new())));
        assert!(parse_env("=1").is_err());
        assert!(parse_env("A").is_err());
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from([
            "dockwarden", "recreate", "edge-1", "web", "--image", "nginx:1.27", "--env", "A=1", "--env", "B=2",
        ])
        .unwrap();
        match args.command {
            Command::Recreate { env, image, pull, .. } => {
                assert_eq!(env.len(), 2);
                assert_eq!(image.as_deref(), Some("nginx:1.27"));
                assert!(!pull);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = Args::try_parse_from(["dockwarden", "exec", "edge-1", "web", "--", "ls", "-la"]).unwrap();
        match args.command {
            Command::Exec { cmd, .. } => assert_eq!(cmd, vec!["ls", "-la"]),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
