//! Account balances.
//!
//! The [`Ledger`] maps identities to unsigned balances. It is mutated only by
//! the chain state machine (under the node lock) when blocks are attached or,
//! during a fork switch, reverted. [`Ledger::collect_valid`] is a dry run
//! that never touches the real balances.

use std::collections::HashMap;

use crate::block::BlockData;
use crate::crypto::keys::Identity;
use crate::transaction::Transaction;

/// Ledger errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("insufficient balance for {identity}: has {balance}, needs {amount}")]
    InsufficientBalance {
        identity: Identity,
        balance: u64,
        amount: u64,
    },
    #[error("balance overflow for {0}")]
    BalanceOverflow(Identity),
}

/// Per-identity balances.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    balances: HashMap<Identity, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance of `identity`; unknown identities hold zero.
    pub fn balance(&self, identity: &Identity) -> u64 {
        self.balances.get(identity).copied().unwrap_or(0)
    }

    /// Number of identities holding a nonzero balance.
    pub fn accounts(&self) -> usize {
        self.balances.len()
    }

    /// Sum of all balances.
    pub fn total_supply(&self) -> u128 {
        self.balances.values().map(|b| *b as u128).sum()
    }

    /// Move `tx.amount` from sender to recipient.
    ///
    /// Causal validity is the caller's job (see [`Ledger::collect_valid`]);
    /// this only refuses to wrap around.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), StateError> {
        self.debit(tx.sender(), tx.amount)?;
        if let Err(e) = self.credit(&tx.recipient, tx.amount) {
            // Undo the debit; it cannot fail since we just took the amount out.
            let _ = self.credit(tx.sender(), tx.amount);
            return Err(e);
        }
        Ok(())
    }

    /// Credit a block producer.
    pub fn apply_reward(&mut self, identity: &Identity, amount: u64) -> Result<(), StateError> {
        self.credit(identity, amount)
    }

    /// Exact inverse of [`Ledger::apply_transaction`].
    pub fn revert_transaction(&mut self, tx: &Transaction) -> Result<(), StateError> {
        self.debit(&tx.recipient, tx.amount)?;
        if let Err(e) = self.credit(tx.sender(), tx.amount) {
            let _ = self.credit(&tx.recipient, tx.amount);
            return Err(e);
        }
        Ok(())
    }

    /// Exact inverse of [`Ledger::apply_reward`].
    pub fn revert_reward(&mut self, identity: &Identity, amount: u64) -> Result<(), StateError> {
        self.debit(identity, amount)
    }

    /// Apply every transaction of `block` in order, then its reward.
    ///
    /// All-or-nothing: on error the ledger is left as it was.
    pub fn apply_block(&mut self, block: &BlockData) -> Result<(), StateError> {
        for (applied, tx) in block.transactions.iter().enumerate() {
            if let Err(e) = self.apply_transaction(tx) {
                self.unwind_transactions(&block.transactions[..applied]);
                return Err(e);
            }
        }
        if let Err(e) = self.apply_reward(block.producer(), block.reward) {
            self.unwind_transactions(&block.transactions);
            return Err(e);
        }
        Ok(())
    }

    /// Undo [`Ledger::apply_block`]: reward first, then transactions newest-first.
    ///
    /// All-or-nothing like [`Ledger::apply_block`].
    pub fn revert_block(&mut self, block: &BlockData) -> Result<(), StateError> {
        self.revert_reward(block.producer(), block.reward)?;
        for (index, tx) in block.transactions.iter().enumerate().rev() {
            if let Err(e) = self.revert_transaction(tx) {
                for redo in &block.transactions[index + 1..] {
                    let _ = self.apply_transaction(redo);
                }
                let _ = self.apply_reward(block.producer(), block.reward);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Revert transactions that were just applied, newest first.
    fn unwind_transactions(&mut self, applied: &[Transaction]) {
        for tx in applied.iter().rev() {
            // Each one was applied a moment ago, so its inverse cannot fail.
            let _ = self.revert_transaction(tx);
        }
    }

    /// Dry-run filter: which of `transactions` could be applied, in timestamp
    /// order, starting from the current balances.
    ///
    /// Transactions are stably sorted by timestamp and replayed against a
    /// scratch copy of the touched balances. With `skip_invalid` an
    /// unaffordable transaction is dropped and the rest continue; without it,
    /// any unaffordable transaction makes the whole result empty.
    pub fn collect_valid(&self, transactions: &[Transaction], skip_invalid: bool) -> Vec<Transaction> {
        let mut ordered: Vec<&Transaction> = transactions.iter().collect();
        ordered.sort_by_key(|tx| tx.unit.timestamp);

        let mut scratch: HashMap<&Identity, u64> = HashMap::new();
        let mut valid = Vec::with_capacity(ordered.len());

        for tx in ordered {
            if self.try_transfer(&mut scratch, tx) {
                valid.push(tx.clone());
            } else if !skip_invalid {
                return Vec::new();
            }
        }
        valid
    }

    fn try_transfer<'a>(&self, scratch: &mut HashMap<&'a Identity, u64>, tx: &'a Transaction) -> bool {
        if tx.sender() == &tx.recipient {
            return false;
        }
        let sender = *scratch
            .entry(tx.sender())
            .or_insert_with(|| self.balance(tx.sender()));
        let recipient = *scratch
            .entry(&tx.recipient)
            .or_insert_with(|| self.balance(&tx.recipient));
        let (Some(new_sender), Some(new_recipient)) = (
            sender.checked_sub(tx.amount),
            recipient.checked_add(tx.amount),
        ) else {
            return false;
        };
        scratch.insert(tx.sender(), new_sender);
        scratch.insert(&tx.recipient, new_recipient);
        true
    }

    fn debit(&mut self, identity: &Identity, amount: u64) -> Result<(), StateError> {
        let balance = self.balance(identity);
        let remaining = balance
            .checked_sub(amount)
            .ok_or_else(|| StateError::InsufficientBalance {
                identity: identity.clone(),
                balance,
                amount,
            })?;
        // Drained accounts are dropped so that apply-then-revert restores
        // the exact map.
        if remaining == 0 {
            self.balances.remove(identity);
        } else {
            self.balances.insert(identity.clone(), remaining);
        }
        Ok(())
    }

    fn credit(&mut self, identity: &Identity, amount: u64) -> Result<(), StateError> {
        let balance = self.balance(identity);
        let total = balance
            .checked_add(amount)
            .ok_or_else(|| StateError::BalanceOverflow(identity.clone()))?;
        if total > 0 {
            self.balances.insert(identity.clone(), total);
        }
        Ok(())
    }
}
