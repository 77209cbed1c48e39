//! The canonical chain.
//!
//! Blocks live in an arena keyed by hash. `parent`/`next` are hash links, so
//! the main chain from genesis to `head` is a doubly linked list inside the
//! arena. Every block in the arena is on the main chain: a fork switch
//! removes abandoned blocks before adopting foreign ones.

use std::collections::HashMap;

use super::fork::{ForkError, ForkSwitch};
use super::poll::{Poll, SlotError};
use super::schedule::Schedule;
use crate::block::{BlockData, BlockError, BlockHash};
use crate::network::{PeerId, Transport, TransportError};
use crate::state::{Ledger, StateError};

/// A block placed in the arena.
#[derive(Clone, Debug)]
pub struct Block {
    pub data: BlockData,
    pub parent: Option<BlockHash>,
    pub next: Option<BlockHash>,
    pub height: u64,
}

/// Reasons a block was not attached or a fork not adopted.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("block {0} already attached")]
    Duplicate(BlockHash),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("ledger accepts only {accepted} of {total} transactions")]
    LedgerRejected { accepted: usize, total: usize },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result of [`ChainState::receive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// Already in the arena; nothing done.
    Known,
    /// Appended on top of the previous head.
    Extended(BlockHash),
    /// Head moved to a longer foreign branch.
    Switched(ForkSwitch),
}

/// Arena, head pointer and the ledger derived from the main chain.
pub struct ChainState {
    pub(super) blocks: HashMap<BlockHash, Block>,
    pub(super) genesis: BlockHash,
    pub(super) head: BlockHash,
    pub(super) ledger: Ledger,
    pub(super) reward: u64,
    pub(super) schedule: Schedule,
}

impl ChainState {
    /// A chain holding only the genesis block.
    pub fn new(reward: u64, schedule: Schedule) -> Self {
        let genesis = BlockData::genesis();
        let hash = genesis.hash;
        let mut blocks = HashMap::new();
        blocks.insert(
            hash,
            Block {
                data: genesis,
                parent: None,
                next: None,
                height: 0,
            },
        );
        ChainState {
            blocks,
            genesis: hash,
            head: hash,
            ledger: Ledger::new(),
            reward,
            schedule,
        }
    }

    pub fn head(&self) -> BlockHash {
        self.head
    }

    pub fn head_block(&self) -> &Block {
        &self.blocks[&self.head]
    }

    pub fn genesis(&self) -> BlockHash {
        self.genesis
    }

    pub fn block(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn height(&self) -> u64 {
        self.head_block().height
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn reward(&self) -> u64 {
        self.reward
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Hashes from genesis to head.
    pub fn main_chain(&self) -> Vec<BlockHash> {
        let mut hashes = Vec::with_capacity(self.blocks.len());
        let mut cursor = Some(self.genesis);
        while let Some(hash) = cursor {
            hashes.push(hash);
            cursor = self.blocks.get(&hash).and_then(|b| b.next);
        }
        hashes
    }

    /// Verify `data` as the child of the current head, apply its ledger
    /// effects and make it the new head.
    pub fn attach(&mut self, data: BlockData) -> Result<BlockHash, ChainError> {
        if self.blocks.contains_key(&data.hash) {
            return Err(ChainError::Duplicate(data.hash));
        }
        let head = self.head_block();
        data.verify_against(&head.data, self.reward)?;
        let height = head.height + 1;

        let total = data.transactions.len();
        let accepted = self.ledger.collect_valid(&data.transactions, false).len();
        if accepted != total {
            return Err(ChainError::LedgerRejected { accepted, total });
        }
        self.ledger.apply_block(&data)?;

        let hash = data.hash;
        let parent = self.head;
        tracing::info!(
            block = %hash.short(),
            height,
            producer = %data.producer().short(),
            txs = data.transactions.len(),
            votes = data.votes.len(),
            "Attached block"
        );
        self.blocks.insert(
            hash,
            Block {
                data,
                parent: Some(parent),
                next: None,
                height,
            },
        );
        if let Some(prev) = self.blocks.get_mut(&parent) {
            prev.next = Some(hash);
        }
        self.head = hash;
        Ok(hash)
    }

    /// Handle a block announced by `origin` at local time `now`.
    ///
    /// Past the first block, only the delegate owning the current slot may
    /// extend or fork the chain. Votes carried by every newly attached block
    /// are fed to the poll.
    pub async fn receive(
        &mut self,
        data: BlockData,
        origin: &PeerId,
        now: i64,
        poll: &Poll,
        transport: &dyn Transport,
    ) -> Result<Received, ChainError> {
        if self.blocks.contains_key(&data.hash) {
            return Ok(Received::Known);
        }
        if self.head != self.genesis {
            poll.is_valid(&data, now).await?;
        }

        if data.parent_hash == self.head {
            let hash = self.attach(data)?;
            self.submit_votes(&[hash], poll);
            return Ok(Received::Extended(hash));
        }

        let switch = self.switch_to_longest(data, origin, transport).await?;
        self.submit_votes(&switch.adopted, poll);
        Ok(Received::Switched(switch))
    }

    fn submit_votes(&self, hashes: &[BlockHash], poll: &Poll) {
        for hash in hashes {
            if let Some(block) = self.blocks.get(hash) {
                for vote in &block.data.votes {
                    poll.submit_vote(vote.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::poll::PollConfig;
    use crate::crypto::keys::SigningKeypair;
    use crate::network::Message;
    use crate::transaction::Transaction;
    use crate::vote::Vote;
    use async_trait::async_trait;

    const SEC: i64 = crate::constants::NANOS_PER_SEC;
    const REWARD: u64 = 10;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn broadcast(&self, _message: Message) {}

        async fn request_block(
            &self,
            _peer: &PeerId,
            hash: BlockHash,
        ) -> Result<BlockData, TransportError> {
            Err(TransportError::BlockNotFound(hash))
        }
    }

    fn schedule() -> Schedule {
        Schedule::new(crate::constants::GENESIS_TIMESTAMP, 10 * SEC, 3, SEC)
    }

    fn chain() -> ChainState {
        ChainState::new(REWARD, schedule())
    }

    fn next_block(chain: &ChainState, kp: &SigningKeypair, txs: Vec<Transaction>) -> BlockData {
        let head = &chain.head_block().data;
        BlockData::produce(kp, head.hash, txs, vec![], REWARD, head.unit.timestamp + 10 * SEC)
    }

    #[test]
    fn attach_advances_head_and_pays_reward() {
        let kp = SigningKeypair::generate();
        let mut chain = chain();
        let block = next_block(&chain, &kp, vec![]);
        let hash = chain.attach(block).unwrap();
        assert_eq!(chain.head(), hash);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.ledger().balance(&kp.identity()), REWARD);
        assert_eq!(chain.block(&chain.genesis()).unwrap().next, Some(hash));
        assert_eq!(chain.main_chain(), vec![chain.genesis(), hash]);
    }

    #[test]
    fn duplicate_rejected() {
        let kp = SigningKeypair::generate();
        let mut chain = chain();
        let block = next_block(&chain, &kp, vec![]);
        chain.attach(block.clone()).unwrap();
        assert!(matches!(chain.attach(block), Err(ChainError::Duplicate(_))));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn unaffordable_transaction_rejects_block() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let mut chain = chain();
        let ts = chain.head_block().data.unit.timestamp + 1;
        let tx = Transaction::pay(&alice, bob.identity(), 5, ts);
        let block = next_block(&chain, &alice, vec![tx]);
        assert!(matches!(
            chain.attach(block),
            Err(ChainError::LedgerRejected {
                accepted: 0,
                total: 1
            })
        ));
        assert_eq!(chain.head(), chain.genesis());
        assert_eq!(chain.ledger().total_supply(), 0);
    }

    #[test]
    fn reward_funds_later_payment() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let mut chain = chain();
        chain.attach(next_block(&chain, &alice, vec![])).unwrap();
        let ts = chain.head_block().data.unit.timestamp + 1;
        let tx = Transaction::pay(&alice, bob.identity(), 4, ts);
        chain.attach(next_block(&chain, &bob, vec![tx])).unwrap();
        assert_eq!(chain.ledger().balance(&alice.identity()), REWARD - 4);
        assert_eq!(chain.ledger().balance(&bob.identity()), 4 + REWARD);
    }

    #[test]
    fn block_on_wrong_parent_rejected_by_attach() {
        let kp = SigningKeypair::generate();
        let mut chain = chain();
        let first = next_block(&chain, &kp, vec![]);
        chain.attach(first.clone()).unwrap();
        let sibling = BlockData::produce(
            &kp,
            chain.genesis(),
            vec![],
            vec![],
            REWARD,
            first.unit.timestamp + 10 * SEC,
        );
        assert!(matches!(
            chain.attach(sibling),
            Err(ChainError::Block(BlockError::ParentMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn receive_skips_slot_check_on_first_block() {
        let kp = SigningKeypair::generate();
        let poll = Poll::spawn(PollConfig::default(), schedule());
        let mut chain = chain();
        let block = next_block(&chain, &kp, vec![]);
        let hash = block.hash;
        let origin = kp.identity();
        let got = chain
            .receive(block.clone(), &origin, 0, &poll, &NoTransport)
            .await
            .unwrap();
        assert_eq!(got, Received::Extended(hash));
        let again = chain
            .receive(block, &origin, 0, &poll, &NoTransport)
            .await
            .unwrap();
        assert_eq!(again, Received::Known);
    }

    #[tokio::test]
    async fn receive_enforces_slot_owner_after_first_block() {
        let first_producer = SigningKeypair::generate();
        let outsider = SigningKeypair::generate();
        let poll = Poll::spawn(PollConfig::default(), schedule());
        let mut chain = chain();
        chain
            .attach(next_block(&chain, &first_producer, vec![]))
            .unwrap();
        let block = next_block(&chain, &outsider, vec![]);
        let now = block.unit.timestamp;
        let err = chain
            .receive(block, &outsider.identity(), now, &poll, &NoTransport)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Slot(SlotError::WrongSlot { .. })));
        assert_eq!(chain.height(), 1);
    }

    #[tokio::test]
    async fn votes_in_attached_block_reach_poll() {
        let voter = SigningKeypair::generate();
        let candidate = SigningKeypair::generate();
        let poll = Poll::spawn(PollConfig::default(), schedule());
        let mut chain = chain();
        let head = chain.head_block().data.clone();
        let vote = Vote::new(&voter, candidate.identity(), head.unit.timestamp + 1);
        let block = BlockData::produce(
            &voter,
            head.hash,
            vec![],
            vec![vote],
            REWARD,
            head.unit.timestamp + 10 * SEC,
        );
        chain
            .receive(block, &voter.identity(), 0, &poll, &NoTransport)
            .await
            .unwrap();
        assert_eq!(poll.votes(&candidate.identity()).await, 1);
        assert_eq!(poll.position(&candidate.identity()).await, Some(0));
    }
}
