//! Slotchain node and operator binary.
//!
//! Runs a delegated proof-of-stake node with P2P networking, slot-based
//! block production and a JSON RPC API. The remaining subcommands talk to a
//! running node over that API.
//!
//! Usage:
//!   slotchain                               # run node (default)
//!   slotchain node --peers 10.0.0.2:9832    # run node with bootstrap peers
//!   slotchain status                        # head, pools and delegates
//!   slotchain balance [identity]            # balance (node's own by default)
//!   slotchain pay <identity> <amount>       # pay from the node's key
//!   slotchain vote <identity>               # vote with the node's key
//!   slotchain produce                       # produce a block now

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use slotchain::config::SlotchainConfig;

/// Slotchain delegated proof-of-stake node.
#[derive(Parser, Debug)]
#[command(
    name = "slotchain",
    version,
    about = "Slotchain delegated proof-of-stake ledger node"
)]
struct Cli {
    /// Data directory holding `slotchain.toml`.
    #[arg(long, default_value = "./slotchain-data", global = true)]
    data_dir: PathBuf,

    /// RPC address; overrides the config file.
    #[arg(long, global = true)]
    rpc_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the slotchain node.
    Node {
        /// P2P listen address; overrides the config file.
        #[arg(long)]
        listen_addr: Option<SocketAddr>,

        /// Bootstrap peer addresses (comma-separated).
        #[arg(long, value_delimiter = ',')]
        peers: Vec<SocketAddr>,
    },

    /// Show head, pending pools and the delegate list.
    Status,

    /// Show the balance of an identity (defaults to the node's own).
    Balance { identity: Option<String> },

    /// Pay from the node's key.
    Pay { recipient: String, amount: u64 },

    /// Vote for a delegate candidate with the node's key.
    Vote { candidate: String },

    /// Produce a block now, ignoring the slot schedule.
    Produce,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SlotchainConfig::load(&cli.data_dir);
    let rpc_addr = match cli.rpc_addr {
        Some(addr) => addr,
        None => format!("{}:{}", config.node.rpc_host, config.node.rpc_port).parse()?,
    };

    match cli.command {
        None => run_node(config, rpc_addr, None, vec![]).await,
        Some(Command::Node { listen_addr, peers }) => {
            run_node(config, rpc_addr, listen_addr, peers).await
        }
        Some(Command::Status) => slotchain::cli::cmd_status(rpc_addr).await,
        Some(Command::Balance { identity }) => slotchain::cli::cmd_balance(rpc_addr, identity).await,
        Some(Command::Pay { recipient, amount }) => {
            slotchain::cli::cmd_pay(rpc_addr, &recipient, amount).await
        }
        Some(Command::Vote { candidate }) => slotchain::cli::cmd_vote(rpc_addr, &candidate).await,
        Some(Command::Produce) => slotchain::cli::cmd_produce(rpc_addr).await,
    }
}

async fn run_node(
    config: SlotchainConfig,
    rpc_addr: SocketAddr,
    listen_addr: Option<SocketAddr>,
    peers: Vec<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr = match listen_addr {
        Some(addr) => addr,
        None => format!("{}:{}", config.node.p2p_host, config.node.p2p_port).parse()?,
    };
    let mut bootstrap_peers = config.parse_bootstrap_peers();
    for peer in peers {
        if !bootstrap_peers.contains(&peer) {
            bootstrap_peers.push(peer);
        }
    }

    tracing::info!("Starting slotchain node...");
    tracing::info!("P2P: {}", listen_addr);
    tracing::info!("RPC: {}", rpc_addr);

    let node_config = slotchain::node::NodeConfig {
        listen_addr,
        bootstrap_peers,
        max_peers: config.node.max_peers,
        keypair: slotchain::crypto::keys::SigningKeypair::generate(),
        consensus: config.consensus.clone(),
    };
    let mut node = slotchain::node::Node::new(node_config).await?;

    let rpc_state = slotchain::node::rpc::RpcState {
        node: node.handle(),
        p2p: Some(node.p2p_handle()),
    };
    tokio::spawn(async move {
        if let Err(e) = slotchain::node::rpc::serve(rpc_addr, rpc_state).await {
            tracing::error!(error = %e, "RPC server stopped");
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    node.run(shutdown).await;
    Ok(())
}
