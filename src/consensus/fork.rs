//! Longest-fork reconciliation.
//!
//! When a block arrives whose parent is not the head, we walk back from both
//! tips until they meet. Legitimate timestamps sit on slot boundaries, so two
//! branches that share an ancestor reach it at exactly the same timestamp.
//! The foreign branch is adopted only if it has strictly more blocks past
//! that ancestor, and only all at once.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;

use super::chain::{Block, ChainError, ChainState};
use super::schedule::Schedule;
use crate::block::{BlockData, BlockHash};
use crate::crypto::keys::Identity;
use crate::network::{Message, PeerId, Transport, TransportError};
use crate::signable::{self, SignableError};

/// Why a foreign branch was refused during the walk.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ForkError {
    /// Adopting the fork would unwind more local blocks than allowed.
    #[error("fork reaches back more than {} local blocks", crate::constants::MAX_FORK_DEPTH)]
    TooDeep,
    #[error("block {0} does not hash to its declared hash")]
    HashMismatch(BlockHash),
    #[error("block {parent} is not a valid parent of {child}")]
    InvalidParent { child: BlockHash, parent: BlockHash },
    #[error("{producer} produced block {block} out of turn")]
    ProducedOutOfOrder { producer: Identity, block: BlockHash },
    #[error("fork does not meet the local chain above genesis")]
    BelowGenesis,
    #[error("fork is not longer: {mine} local blocks against {theirs}")]
    NotLonger { mine: usize, theirs: usize },
    #[error("fork block {block}: {source}")]
    Signature {
        block: BlockHash,
        #[source]
        source: SignableError,
    },
}

/// Summary of an adopted fork.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ForkSwitch {
    pub ancestor: BlockHash,
    /// Former main-chain blocks, newest first.
    pub abandoned: Vec<BlockHash>,
    /// Newly attached blocks, oldest first.
    pub adopted: Vec<BlockHash>,
}

impl ChainState {
    /// Replace the main chain past the common ancestor with the branch ending
    /// at `tip`, if that branch is strictly longer.
    ///
    /// Unknown ancestors of `tip` are fetched from `origin`. On any failure
    /// the head, links, arena and ledger are exactly as before the call.
    ///
    /// Only the local side of the walk is capped. The foreign side is bounded
    /// by slot spacing, so a node catching up from genesis can adopt a branch
    /// of any length.
    pub async fn switch_to_longest(
        &mut self,
        tip: BlockData,
        origin: &PeerId,
        transport: &dyn Transport,
    ) -> Result<ForkSwitch, ChainError> {
        if tip.compute_hash() != tip.hash {
            return Err(ForkError::HashMismatch(tip.hash).into());
        }

        let period = self.schedule.slot_period();
        let epsilon = self.schedule.epsilon();
        let round = self.schedule.round_duration();
        let tip_signer = tip.producer().clone();
        let tip_ts = tip.unit.timestamp;

        // Foreign branch, newest first; the last entry is the walk cursor.
        let mut theirs: Vec<BlockData> = vec![tip];
        let mut mine = self.head;
        let mut my_len = 0usize;

        loop {
            if my_len > crate::constants::MAX_FORK_DEPTH {
                return Err(ForkError::TooDeep.into());
            }
            let Some(cursor) = theirs.last() else {
                return Err(ForkError::BelowGenesis.into());
            };
            let my_block = &self.blocks[&mine];
            let (their_ts, my_ts) = (cursor.unit.timestamp, my_block.data.unit.timestamp);

            if their_ts == my_ts && cursor.hash == mine {
                break;
            }

            let step_theirs = their_ts >= my_ts;
            let step_mine = my_ts >= their_ts;

            if step_mine {
                match my_block.parent {
                    Some(parent) => {
                        mine = parent;
                        my_len += 1;
                    }
                    None => return Err(ForkError::BelowGenesis.into()),
                }
            }

            if step_theirs {
                if cursor.is_genesis() {
                    return Err(ForkError::BelowGenesis.into());
                }
                let child_hash = cursor.hash;
                let child_ts = their_ts;
                let parent_hash = cursor.parent_hash;
                let parent = self.fetch_parent(parent_hash, origin, transport).await?;

                if child_ts.saturating_sub(parent.unit.timestamp) < period - epsilon {
                    return Err(ForkError::InvalidParent {
                        child: child_hash,
                        parent: parent.hash,
                    }
                    .into());
                }
                if *parent.producer() == tip_signer
                    && tip_ts.saturating_sub(parent.unit.timestamp) < round - epsilon
                {
                    return Err(ForkError::ProducedOutOfOrder {
                        producer: tip_signer,
                        block: parent.hash,
                    }
                    .into());
                }
                theirs.push(parent);
            }
        }

        // `theirs` ends with the shared ancestor.
        let their_len = theirs.len() - 1;
        if my_len >= their_len {
            return Err(ForkError::NotLonger {
                mine: my_len,
                theirs: their_len,
            }
            .into());
        }

        theirs.pop();
        theirs.reverse();
        self.replace_suffix(mine, theirs)
    }

    /// Look a parent up locally, else ask `origin` and check that what came
    /// back is the block we asked for and is properly signed.
    async fn fetch_parent(
        &self,
        hash: BlockHash,
        origin: &PeerId,
        transport: &dyn Transport,
    ) -> Result<BlockData, ChainError> {
        if let Some(block) = self.blocks.get(&hash) {
            return Ok(block.data.clone());
        }
        let data = transport.request_block(origin, hash).await?;
        if data.hash != hash || data.compute_hash() != hash {
            return Err(ForkError::HashMismatch(hash).into());
        }
        signable::verify(&data).map_err(|source| ForkError::Signature {
            block: hash,
            source,
        })?;
        Ok(data)
    }

    /// Rewind to `ancestor` and attach `branch` (oldest first), all or nothing.
    fn replace_suffix(
        &mut self,
        ancestor: BlockHash,
        branch: Vec<BlockData>,
    ) -> Result<ForkSwitch, ChainError> {
        let saved_head = self.head;
        let saved_ledger = self.ledger.clone();

        let mut removed: Vec<(BlockHash, Block)> = Vec::new();
        while self.head != ancestor {
            let hash = self.head;
            let Some(block) = self.blocks.remove(&hash) else {
                break;
            };
            if let Err(e) = self.ledger.revert_block(&block.data) {
                self.blocks.insert(hash, block);
                self.restore(saved_head, saved_ledger, removed, &[]);
                return Err(e.into());
            }
            self.head = block.parent.unwrap_or(self.genesis);
            removed.push((hash, block));
        }
        if let Some(a) = self.blocks.get_mut(&ancestor) {
            a.next = None;
        }

        let mut adopted = Vec::with_capacity(branch.len());
        for data in branch {
            match self.attach(data) {
                Ok(hash) => adopted.push(hash),
                Err(e) => {
                    tracing::warn!(error = %e, "Fork replay failed, restoring previous head");
                    self.restore(saved_head, saved_ledger, removed, &adopted);
                    return Err(e);
                }
            }
        }

        let abandoned: Vec<BlockHash> = removed.iter().map(|(h, _)| *h).collect();
        tracing::info!(
            ancestor = %ancestor.short(),
            abandoned = abandoned.len(),
            adopted = adopted.len(),
            head = %self.head.short(),
            "Switched to longer fork"
        );
        Ok(ForkSwitch {
            ancestor,
            abandoned,
            adopted,
        })
    }

    fn restore(
        &mut self,
        head: BlockHash,
        ledger: crate::state::Ledger,
        removed: Vec<(BlockHash, Block)>,
        attached: &[BlockHash],
    ) {
        for hash in attached {
            self.blocks.remove(hash);
        }
        if let Some(old_head) = self.blocks.get_mut(&head) {
            old_head.next = None;
        }
        for (hash, block) in removed {
            if let Some(parent) = block.parent.and_then(|p| self.blocks.get_mut(&p)) {
                parent.next = Some(hash);
            }
            self.blocks.insert(hash, block);
        }
        self.head = head;
        self.ledger = ledger;
    }
}

// ── Branch prefetch ──

/// Foreign ancestors fetched ahead of a fork walk.
///
/// It serves them back as a [`Transport`], so a walk run against it never
/// waits on the network.
#[derive(Debug, Default)]
pub struct FetchedBranch {
    blocks: HashMap<BlockHash, BlockData>,
}

impl FetchedBranch {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[async_trait]
impl Transport for FetchedBranch {
    async fn broadcast(&self, _message: Message) {}

    async fn request_block(
        &self,
        _peer: &PeerId,
        hash: BlockHash,
    ) -> Result<BlockData, TransportError> {
        self.blocks
            .get(&hash)
            .cloned()
            .ok_or(TransportError::BlockNotFound(hash))
    }
}

/// Fetch the ancestors of `tip` from `origin` until one is known locally.
///
/// `is_known` is asked before every request. Fetching stops early at the
/// first block that could not pass the walk's spacing checks; the walk then
/// rejects the branch with the precise reason.
pub async fn fetch_branch<F, Fut>(
    tip: &BlockData,
    schedule: &Schedule,
    origin: &PeerId,
    transport: &dyn Transport,
    mut is_known: F,
) -> Result<FetchedBranch, TransportError>
where
    F: FnMut(BlockHash) -> Fut,
    Fut: Future<Output = bool>,
{
    let min_gap = (schedule.slot_period() - schedule.epsilon()).max(1);
    let mut branch = FetchedBranch::default();
    let mut wanted = tip.parent_hash;
    let mut child_ts = tip.unit.timestamp;

    while !is_known(wanted).await {
        let parent = transport.request_block(origin, wanted).await?;
        let parent_ts = parent.unit.timestamp;
        let next = parent.parent_hash;
        let keep_going = parent.hash == wanted
            && child_ts.saturating_sub(parent_ts) >= min_gap
            && parent_ts > schedule.genesis();
        branch.blocks.insert(wanted, parent);
        if !keep_going {
            break;
        }
        wanted = next;
        child_ts = parent_ts;
    }
    tracing::debug!(blocks = branch.len(), "Fetched fork branch");
    Ok(branch)
}
