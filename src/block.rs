//! Blocks: signed batches of transactions and votes extending a parent.
//!
//! A block's `hash` is the BLAKE3 hash of its corpus, which embeds the
//! signatures of every contained transaction and vote. Changing any nested
//! unit therefore changes the block hash and invalidates the block signature.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Identity, Signature, SigningKeypair, SigningPublicKey};
use crate::signable::{self, Corpus, Signable, SignableError, Unit};
use crate::transaction::Transaction;
use crate::vote::Vote;
use crate::Hash;

/// Content hash of a block.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub Hash);

impl BlockHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: Hash = hex::decode(s).ok()?.try_into().ok()?;
        Some(BlockHash(bytes))
    }

    /// First 8 bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.short())
    }
}

/// Reasons a block is rejected against its would-be parent.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("parent hash mismatch: expected {expected}, found {found}")]
    ParentMismatch {
        expected: BlockHash,
        found: BlockHash,
    },
    #[error("unexpected reward {found}, expected {expected}")]
    WrongReward { expected: u64, found: u64 },
    #[error("declared hash does not match content")]
    HashMismatch,
    #[error("timestamp {timestamp} is not after parent timestamp {parent}")]
    NotAfterParent { timestamp: i64, parent: i64 },
    #[error("transaction {index} timestamp outside the block window")]
    TransactionOutOfWindow { index: usize },
    #[error("transaction {index} invalid: {source}")]
    InvalidTransaction {
        index: usize,
        #[source]
        source: SignableError,
    },
    #[error("vote {index} invalid: {source}")]
    InvalidVote {
        index: usize,
        #[source]
        source: SignableError,
    },
    #[error("block signature: {0}")]
    Signature(#[from] SignableError),
}

/// The wire and signable form of a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub unit: Unit,
    pub parent_hash: BlockHash,
    pub transactions: Vec<Transaction>,
    pub votes: Vec<Vote>,
    pub reward: u64,
    pub hash: BlockHash,
}

impl BlockData {
    /// The fixed, unsigned root of every chain.
    pub fn genesis() -> Self {
        BlockData {
            unit: Unit {
                signer: Identity::none(),
                public_key: SigningPublicKey(Vec::new()),
                timestamp: crate::constants::GENESIS_TIMESTAMP,
                signature: Signature::empty(),
            },
            parent_hash: BlockHash::default(),
            transactions: Vec::new(),
            votes: Vec::new(),
            reward: 0,
            hash: genesis_hash(),
        }
    }

    /// Build, sign and hash a block on top of `parent_hash`.
    pub fn produce(
        keypair: &SigningKeypair,
        parent_hash: BlockHash,
        transactions: Vec<Transaction>,
        votes: Vec<Vote>,
        reward: u64,
        timestamp: i64,
    ) -> Self {
        let mut block = BlockData {
            unit: Unit::new(keypair, timestamp),
            parent_hash,
            transactions,
            votes,
            reward,
            hash: BlockHash::default(),
        };
        block.sign(keypair);
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> BlockHash {
        BlockHash(crate::hash_domain("slotchain.block", &self.corpus()))
    }

    pub fn is_genesis(&self) -> bool {
        self.hash == genesis_hash()
    }

    pub fn producer(&self) -> &Identity {
        &self.unit.signer
    }

    /// Full content check of this block as the child of `parent`.
    ///
    /// Transactions must be non-decreasing in time and fall within
    /// `[parent.timestamp, self.timestamp]`.
    pub fn verify_against(&self, parent: &BlockData, reward: u64) -> Result<(), BlockError> {
        if self.parent_hash != parent.hash {
            return Err(BlockError::ParentMismatch {
                expected: parent.hash,
                found: self.parent_hash,
            });
        }
        if self.reward != reward {
            return Err(BlockError::WrongReward {
                expected: reward,
                found: self.reward,
            });
        }
        if self.compute_hash() != self.hash {
            return Err(BlockError::HashMismatch);
        }
        if self.unit.timestamp <= parent.unit.timestamp {
            return Err(BlockError::NotAfterParent {
                timestamp: self.unit.timestamp,
                parent: parent.unit.timestamp,
            });
        }
        signable::verify(self)?;

        let mut last_ts = parent.unit.timestamp;
        for (index, tx) in self.transactions.iter().enumerate() {
            let ts = tx.unit.timestamp;
            if ts < last_ts || ts > self.unit.timestamp {
                return Err(BlockError::TransactionOutOfWindow { index });
            }
            last_ts = ts;
            tx.verify()
                .map_err(|source| BlockError::InvalidTransaction { index, source })?;
        }
        for (index, vote) in self.votes.iter().enumerate() {
            vote.verify()
                .map_err(|source| BlockError::InvalidVote { index, source })?;
        }
        Ok(())
    }
}

impl Signable for BlockData {
    fn unit(&self) -> &Unit {
        &self.unit
    }

    fn unit_mut(&mut self) -> &mut Unit {
        &mut self.unit
    }

    fn corpus(&self) -> Vec<u8> {
        let mut corpus = Corpus::new();
        self.unit.write_corpus(&mut corpus);
        corpus.push_bytes(self.parent_hash.to_hex().as_bytes());
        for tx in &self.transactions {
            corpus.push_bytes(tx.unit.signature.as_bytes());
        }
        for vote in &self.votes {
            corpus.push_bytes(vote.unit.signature.as_bytes());
        }
        corpus.push_uvarint(self.reward);
        corpus.into_bytes()
    }
}

/// Well-known hash of the genesis block.
pub fn genesis_hash() -> BlockHash {
    BlockHash(crate::hash_domain("slotchain.genesis", b"genesis"))
}
