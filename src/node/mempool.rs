//! Pending transactions and votes.
//!
//! Entries are deduplicated by signature (through the unit id, which hashes
//! the signature) and kept in arrival order. Both pools are bounded; once a
//! pool is full new entries are refused rather than evicting old ones, and
//! everything is dropped when a block is attached.

use std::collections::HashSet;

use crate::transaction::Transaction;
use crate::vote::Vote;
use crate::Hash;

/// Errors from mempool operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    #[error("already pending")]
    Duplicate,
    #[error("{pool} pool is full ({capacity} entries)")]
    Full { pool: &'static str, capacity: usize },
}

/// Configuration for the mempool.
#[derive(Clone, Debug)]
pub struct MempoolConfig {
    pub max_transactions: usize,
    pub max_votes: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_transactions: crate::constants::MEMPOOL_MAX_TXS,
            max_votes: crate::constants::MEMPOOL_MAX_VOTES,
        }
    }
}

/// Summary statistics for RPC reporting.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct MempoolStats {
    pub transaction_count: usize,
    pub vote_count: usize,
    pub max_transactions: usize,
    pub max_votes: usize,
}

#[derive(Default)]
pub struct Mempool {
    config: MempoolConfig,
    transactions: Vec<Transaction>,
    votes: Vec<Vote>,
    tx_ids: HashSet<Hash>,
    vote_ids: HashSet<Hash>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            config,
            transactions: Vec::new(),
            votes: Vec::new(),
            tx_ids: HashSet::new(),
            vote_ids: HashSet::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MempoolConfig::default())
    }

    /// Add a transaction. Returns its id.
    pub fn insert_transaction(&mut self, tx: Transaction) -> Result<Hash, MempoolError> {
        let id = tx.id();
        if self.tx_ids.contains(&id) {
            return Err(MempoolError::Duplicate);
        }
        if self.transactions.len() >= self.config.max_transactions {
            return Err(MempoolError::Full {
                pool: "transaction",
                capacity: self.config.max_transactions,
            });
        }
        self.tx_ids.insert(id);
        self.transactions.push(tx);
        Ok(id)
    }

    /// Add a vote. Returns its id.
    pub fn insert_vote(&mut self, vote: Vote) -> Result<Hash, MempoolError> {
        let id = vote.id();
        if self.vote_ids.contains(&id) {
            return Err(MempoolError::Duplicate);
        }
        if self.votes.len() >= self.config.max_votes {
            return Err(MempoolError::Full {
                pool: "vote",
                capacity: self.config.max_votes,
            });
        }
        self.vote_ids.insert(id);
        self.votes.push(vote);
        Ok(id)
    }

    /// Pending transactions in arrival order.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Pending votes in arrival order.
    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn contains_transaction(&self, id: &Hash) -> bool {
        self.tx_ids.contains(id)
    }

    pub fn contains_vote(&self, id: &Hash) -> bool {
        self.vote_ids.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.votes.is_empty()
    }

    /// Drop every pending entry.
    pub fn clear(&mut self) {
        self.transactions.clear();
        self.votes.clear();
        self.tx_ids.clear();
        self.vote_ids.clear();
    }

    /// Stats for RPC reporting.
    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            transaction_count: self.transactions.len(),
            vote_count: self.votes.len(),
            max_transactions: self.config.max_transactions,
            max_votes: self.config.max_votes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;

    fn small_pool() -> Mempool {
        Mempool::new(MempoolConfig {
            max_transactions: 2,
            max_votes: 1,
        })
    }

    #[test]
    fn duplicate_transaction_ignored() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let mut pool = Mempool::with_defaults();
        let tx = Transaction::pay(&alice, bob.identity(), 5, 1);
        let id = pool.insert_transaction(tx.clone()).unwrap();
        assert!(pool.contains_transaction(&id));
        assert_eq!(pool.insert_transaction(tx), Err(MempoolError::Duplicate));
        assert_eq!(pool.transactions().len(), 1);
    }

    #[test]
    fn same_payment_with_new_signature_is_distinct() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let mut pool = Mempool::with_defaults();
        pool.insert_transaction(Transaction::pay(&alice, bob.identity(), 5, 1))
            .unwrap();
        pool.insert_transaction(Transaction::pay(&alice, bob.identity(), 5, 2))
            .unwrap();
        assert_eq!(pool.stats().transaction_count, 2);
    }

    #[test]
    fn full_pools_refuse_new_entries() {
        let k: Vec<_> = (0..3).map(|_| SigningKeypair::generate()).collect();
        let mut pool = small_pool();
        for ts in 0..2 {
            pool.insert_transaction(Transaction::pay(&k[0], k[1].identity(), 1, ts))
                .unwrap();
        }
        assert_eq!(
            pool.insert_transaction(Transaction::pay(&k[0], k[1].identity(), 1, 9)),
            Err(MempoolError::Full {
                pool: "transaction",
                capacity: 2
            })
        );

        pool.insert_vote(Vote::new(&k[0], k[1].identity(), 0)).unwrap();
        assert!(matches!(
            pool.insert_vote(Vote::new(&k[0], k[2].identity(), 0)),
            Err(MempoolError::Full { pool: "vote", .. })
        ));
    }

    #[test]
    fn clear_empties_both_pools() {
        let k: Vec<_> = (0..2).map(|_| SigningKeypair::generate()).collect();
        let mut pool = Mempool::with_defaults();
        let tx = Transaction::pay(&k[0], k[1].identity(), 1, 0);
        let vote = Vote::new(&k[0], k[1].identity(), 0);
        pool.insert_transaction(tx.clone()).unwrap();
        pool.insert_vote(vote.clone()).unwrap();
        assert!(!pool.is_empty());

        pool.clear();
        assert!(pool.is_empty());
        // Cleared entries may be pooled again.
        assert!(pool.insert_transaction(tx).is_ok());
        assert!(pool.insert_vote(vote).is_ok());
    }

    #[test]
    fn stats_reporting() {
        let pool = small_pool();
        assert_eq!(
            pool.stats(),
            MempoolStats {
                transaction_count: 0,
                vote_count: 0,
                max_transactions: 2,
                max_votes: 1,
            }
        );
    }
}
