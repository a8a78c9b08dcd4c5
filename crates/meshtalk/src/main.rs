//! meshtalk — overlay chat node.
//!
//! # Usage
//!
//! ```bash
//! meshtalk node                        # listen on the configured port
//! meshtalk node --port 2001            # listen on a specific port
//! meshtalk node -b 127.0.0.1:1337     # bootstrap through a known peer
//! ```
//!
//! The node reads `config.yml` from the working directory when present,
//! then starts listening, optionally bootstraps into the overlay, and
//! drops into an interactive prompt:
//!
//! ```text
//! neighbours                 print both neighbour sets
//! post <peer-id> <message>   send a chat to a peer id
//! join <host:port>           handshake a mutual neighbour relation
//! exit                       leave the network and quit
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshtalk::node::{Node, NodeEvent};
use meshtalk::server::Listener;
use meshtalk_core::config::Config;
use meshtalk_core::keys::PeerId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// meshtalk — peer-to-peer overlay chat.
#[derive(Parser, Debug)]
#[command(name = "meshtalk", about = "Peer-to-peer overlay chat node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an overlay node.
    Node {
        /// Listen port. Defaults to `default_port` from the config.
        #[arg(long)]
        port: Option<u16>,

        /// Bootstrap peer as HOST:PORT (or a bare port on the default
        /// IP). Defaults to the config's `bootstrap` section.
        #[arg(short = 'b', long = "bootstrap")]
        bootstrap: Option<String>,

        /// Path to the configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Node {
            port,
            bootstrap,
            config,
        } => run_node(port, bootstrap, config).await,
    }
}

async fn run_node(
    port: Option<u16>,
    bootstrap: Option<String>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    init_logging();

    let config_path = config_path.unwrap_or_else(|| PathBuf::from(Config::DEFAULT_PATH));
    let config = match Config::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            info!("no config file found, using defaults");
            Config::default()
        }
    };

    let bootstrap_addr = match &bootstrap {
        Some(arg) => Some(parse_bootstrap(arg, config.default_ip)?),
        None => config.bootstrap.as_ref().map(|b| b.addr()),
    };

    let port = port.unwrap_or(config.default_port);
    let listener =
        Listener::bind(port, config.max_connections as u32).context("failed to bind listener")?;
    let host_addr = SocketAddrV4::new(config.default_ip, listener.port());

    let node = Arc::new(Node::new(config, host_addr));
    info!(peer_id = %node.peer_id(), addr = %host_addr, "node reachable");

    let accept_task = tokio::spawn(listener.accept_loop(Arc::clone(&node)));

    if let Some(addr) = bootstrap_addr {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            node.bootstrap(addr).await;
        });
    }

    // Print incoming chats above the prompt.
    let mut events = node.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::Chat { from, body } => println!("[{from}] {body}"),
            }
        }
    });

    prompt_loop(&node).await?;

    node.shutdown().await;
    accept_task.abort();
    info!("node stopped");
    Ok(())
}

/// Reads prompt commands from stdin until `exit`, EOF, or Ctrl-C.
async fn prompt_loop(node: &Arc<Node>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                return Ok(());
            }
            line = lines.next_line() => {
                match line? {
                    None => return Ok(()),
                    Some(line) => {
                        if !run_command(node, line.trim()).await {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Executes one prompt command. Returns `false` when the node should
/// shut down.
async fn run_command(node: &Arc<Node>, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        None | Some("") => {}

        Some("neighbours") => {
            println!("inbound neighbours:  {:?}", node.inbound_addrs());
            println!("outbound neighbours: {:?}", node.outbound_addrs());
        }

        Some("post") => {
            let (Some(peer_id), Some(body)) = (parts.next(), parts.next()) else {
                println!("usage: post <peer-id> <message>");
                return true;
            };
            match PeerId::parse(peer_id) {
                Ok(recipient) => match node.post(recipient, body).await {
                    Ok(()) => println!("message sent"),
                    Err(e) => println!("post failed: {e}"),
                },
                Err(e) => println!("invalid peer id: {e}"),
            }
        }

        Some("join") => {
            let Some(addr) = parts.next() else {
                println!("usage: join <host:port>");
                return true;
            };
            match addr.parse::<SocketAddrV4>() {
                Ok(addr) => match node.join(addr).await {
                    Ok(()) => println!("join sent to {addr}"),
                    Err(e) => println!("join failed: {e}"),
                },
                Err(e) => println!("invalid address: {e}"),
            }
        }

        Some("exit") | Some("quit") => return false,

        Some(other) => {
            println!("unknown command: {other}");
            println!("commands: neighbours | post <peer-id> <message> | join <host:port> | exit");
        }
    }
    true
}

/// Parses the `-b` argument: either HOST:PORT or a bare port on the
/// configured default IP.
fn parse_bootstrap(arg: &str, default_ip: Ipv4Addr) -> Result<SocketAddrV4> {
    if let Ok(port) = arg.parse::<u16>() {
        return Ok(SocketAddrV4::new(default_ip, port));
    }
    match arg.parse::<SocketAddrV4>() {
        Ok(addr) => Ok(addr),
        Err(_) => bail!("invalid bootstrap address {arg:?}, expected HOST:PORT"),
    }
}

/// Sets up tracing output to stderr and to `logs/<timestamp>.log`.
///
/// The `MESHTALK_LOG` environment variable controls the level filter
/// (default: info). If the log directory can't be created, the node
/// still runs with stderr logging only.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_env("MESHTALK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = std::fs::create_dir_all("logs")
        .ok()
        .and_then(|_| {
            let name = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S.log").to_string();
            std::fs::File::create(PathBuf::from("logs").join(name)).ok()
        })
        .map(|file| {
            fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
