//! # Slotchain
//!
//! A delegated-proof-of-stake ledger node:
//! - **Weighted delegate election**: voters back up to a fixed number of
//!   candidates; the best-supported candidates become block producers
//! - **Slot scheduling**: every elected producer owns a fixed time slot in a
//!   repeating round, and only the slot owner may extend the chain
//! - **Longest-valid-fork rule**: competing branches are walked back to their
//!   common ancestor and the longer, well-formed one wins
//! - **Post-quantum signatures**: every transaction, vote and block is signed
//!   with CRYSTALS-Dilithium5

pub mod block;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod network;
pub mod node;
pub mod signable;
pub mod state;
pub mod transaction;
pub mod vote;

/// Protocol constants
pub mod constants {
    /// Number of producers elected into the top list.
    pub const DEFAULT_MAX_DELEGATES: usize = 5;
    /// How many candidates a single voter may back at once.
    pub const DEFAULT_MAX_VOTES_PER_VOTER: usize = 3;
    /// Minimum spacing between two votes of the same voter (nanoseconds).
    pub const DEFAULT_VOTE_FREEZE_PERIOD_NS: i64 = 10 * NANOS_PER_SEC;
    /// Length of one production slot (nanoseconds).
    pub const DEFAULT_SLOT_PERIOD_NS: i64 = 10 * NANOS_PER_SEC;
    /// Tolerated clock skew between peers (nanoseconds).
    pub const DEFAULT_TIMING_EPSILON_NS: i64 = NANOS_PER_SEC;
    /// Amount credited to a block's producer.
    pub const DEFAULT_BLOCK_REWARD: u64 = 10;

    pub const NANOS_PER_SEC: i64 = 1_000_000_000;
    pub const NANOS_PER_MILLI: i64 = 1_000_000;

    /// Genesis timestamp: 2018-02-13T06:00:00Z in nanoseconds since the epoch.
    pub const GENESIS_TIMESTAMP: i64 = 1_518_501_600 * NANOS_PER_SEC;

    /// Upper bound on the number of local blocks a fork switch may unwind.
    pub const MAX_FORK_DEPTH: usize = 1_024;

    /// Maximum network message size (16 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Maximum pending transactions held by the mempool
    pub const MEMPOOL_MAX_TXS: usize = 10_000;
    /// Maximum pending votes held by the mempool
    pub const MEMPOOL_MAX_VOTES: usize = 10_000;

    /// Default P2P listen port
    pub const DEFAULT_P2P_PORT: u16 = 9832;
    /// Default RPC listen port
    pub const DEFAULT_RPC_PORT: u16 = 9833;
    /// Maximum number of connected peers
    pub const MAX_PEERS: usize = 64;
    /// Peer connection timeout in milliseconds
    pub const PEER_CONNECT_TIMEOUT_MS: u64 = 5_000;
    /// How long a fork walk waits for a peer to answer a block request.
    pub const BLOCK_REQUEST_TIMEOUT_MS: u64 = 10_000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain is a `&'static str` so an invalid key can never reach
/// BLAKE3's key derivation at runtime.
pub fn hash_domain(domain: &'static str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
///
/// Clocks before the epoch read as zero; values past `i64::MAX` saturate.
pub fn now_nanos() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_NETWORK_MESSAGE_BYTES`.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
