//! Wire protocol and the transport seam used by the chain.
//!
//! Messages are bincode-encoded and framed with a 4-byte little-endian length
//! prefix. The chain never talks to sockets directly: it sees only the
//! [`Transport`] trait, which the TCP layer in [`p2p`] implements and tests
//! replace with in-memory fakes.

pub mod p2p;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block::{BlockData, BlockHash};
use crate::crypto::keys::{Identity, Signature, SigningPublicKey};
use crate::transaction::Transaction;
use crate::vote::Vote;

/// Peers are addressed by their signing identity.
pub type PeerId = Identity;

/// Protocol version announced in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Network protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// First frame on every connection, in both directions.
    Hello {
        version: u32,
        identity: PeerId,
        public_key: SigningPublicKey,
        listen_port: u16,
        /// Fresh per connection; the peer must sign it back.
        nonce: [u8; 32],
    },
    /// Second frame: proof of key possession over the other side's nonce.
    HelloAck { signature: Signature },

    // ── Gossip ──
    NewTransaction(Transaction),
    NewVote(Vote),
    NewBlock(Box<BlockData>),

    // ── Block lookup (fork walks) ──
    GetBlock {
        request_id: u64,
        hash: BlockHash,
    },
    BlockResponse {
        request_id: u64,
        block: Option<Box<BlockData>>,
    },
}

/// Network errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
}

/// Failures surfaced to the chain by a [`Transport`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("peer does not have block {0}")]
    BlockNotFound(BlockHash),
    #[error("block request timed out")]
    Timeout,
    #[error("transport shut down")]
    Shutdown,
}

/// Outbound operations the node needs from the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort delivery to every connected peer.
    async fn broadcast(&self, message: Message);

    /// Fetch one block by hash from a specific peer.
    async fn request_block(&self, peer: &PeerId, hash: BlockHash) -> Result<BlockData, TransportError>;
}

fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 16 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 16 * 1024 * 1024 }>()
}

/// Serialize a message to a length-prefixed frame.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serde::encode_to_vec(msg, bincode_config())
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a length-prefixed frame.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    let (msg, _) = bincode::serde::decode_from_slice(&data[4..4 + len], bincode_config()).ok()?;
    Some(msg)
}
