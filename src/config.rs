//! Configuration file support for the slotchain node.
//!
//! Loads optional `slotchain.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used.
//! Durations in the file are milliseconds; the rest of the crate works in
//! nanoseconds.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::consensus::poll::PollConfig;
use crate::consensus::schedule::Schedule;
use crate::constants::NANOS_PER_MILLI;

/// Name of the config file inside the data directory.
pub const CONFIG_FILE: &str = "slotchain.toml";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SlotchainConfig {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub p2p_host: String,
    pub p2p_port: u16,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub data_dir: String,
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            p2p_host: "0.0.0.0".into(),
            p2p_port: crate::constants::DEFAULT_P2P_PORT,
            rpc_host: "127.0.0.1".into(),
            rpc_port: crate::constants::DEFAULT_RPC_PORT,
            data_dir: "./slotchain-data".into(),
            bootstrap_peers: vec![],
            max_peers: crate::constants::MAX_PEERS,
        }
    }
}

/// Consensus parameters. Every node of a network must agree on these.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub max_delegates: usize,
    pub max_votes_per_voter: usize,
    pub vote_freeze_period_ms: u64,
    pub slot_period_ms: u64,
    pub timing_epsilon_ms: u64,
    pub block_reward: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            max_delegates: crate::constants::DEFAULT_MAX_DELEGATES,
            max_votes_per_voter: crate::constants::DEFAULT_MAX_VOTES_PER_VOTER,
            vote_freeze_period_ms: (crate::constants::DEFAULT_VOTE_FREEZE_PERIOD_NS
                / NANOS_PER_MILLI) as u64,
            slot_period_ms: (crate::constants::DEFAULT_SLOT_PERIOD_NS / NANOS_PER_MILLI) as u64,
            timing_epsilon_ms: (crate::constants::DEFAULT_TIMING_EPSILON_NS / NANOS_PER_MILLI)
                as u64,
            block_reward: crate::constants::DEFAULT_BLOCK_REWARD,
        }
    }
}

fn millis_to_nanos(ms: u64) -> i64 {
    i64::try_from(ms)
        .unwrap_or(i64::MAX)
        .saturating_mul(NANOS_PER_MILLI)
}

impl ConsensusConfig {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            max_delegates: self.max_delegates,
            max_votes_per_voter: self.max_votes_per_voter,
            vote_freeze_period: millis_to_nanos(self.vote_freeze_period_ms),
        }
    }

    /// Slot schedule anchored at the genesis timestamp.
    pub fn schedule(&self) -> Schedule {
        Schedule::new(
            crate::constants::GENESIS_TIMESTAMP,
            millis_to_nanos(self.slot_period_ms),
            self.max_delegates,
            millis_to_nanos(self.timing_epsilon_ms),
        )
    }
}

impl SlotchainConfig {
    /// Load configuration from `slotchain.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist or cannot be parsed.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Parse bootstrap peers into socket addresses, skipping bad entries.
    pub fn parse_bootstrap_peers(&self) -> Vec<SocketAddr> {
        self.node
            .bootstrap_peers
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!(peer = %s, "Ignoring malformed bootstrap peer");
                    None
                }
            })
            .collect()
    }
}
