//! Node orchestrator tying together the chain, poll, mempool and P2P.
//!
//! [`NodeHandle`] carries the node's operations (receive, produce, pay,
//! vote, lookups) and is shared by the event loop and the RPC server. All
//! chain and mempool mutation happens under the single `NodeState` lock;
//! the poll is its own actor.
//!
//! [`Node`] owns the P2P event stream and runs the main loop, dispatching
//! incoming messages and producing a block whenever one of our slots starts.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::mempool::{Mempool, MempoolError};
use crate::block::{BlockData, BlockHash};
use crate::config::ConsensusConfig;
use crate::consensus::chain::{ChainError, ChainState, Received};
use crate::consensus::fork;
use crate::consensus::poll::{self, Poll};
use crate::crypto::keys::{Identity, SigningKeypair};
use crate::network::p2p::{self, P2pConfig, P2pEvent, P2pHandle};
use crate::network::{Message, PeerId, Transport};
use crate::signable::SignableError;
use crate::transaction::Transaction;
use crate::vote::Vote;
use crate::Hash;

/// State guarded by the node lock.
pub struct NodeState {
    pub chain: ChainState,
    pub mempool: Mempool,
}

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid unit: {0}")]
    Invalid(#[from] SignableError),
    #[error("timestamp {timestamp} outside acceptance window ({earliest}, {latest}]")]
    OutOfWindow {
        timestamp: i64,
        earliest: i64,
        latest: i64,
    },
    #[error("mempool: {0}")]
    Mempool(#[from] MempoolError),
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
    #[error("P2P error: {0}")]
    P2p(#[from] p2p::P2pError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A delegate in the top list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateInfo {
    pub identity: Identity,
    pub votes: u64,
}

/// Snapshot reported by `/status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    pub identity: Identity,
    pub head: String,
    pub height: u64,
    pub head_timestamp: i64,
    pub pending_transactions: usize,
    pub pending_votes: usize,
    pub current_slot: usize,
    pub position: Option<usize>,
    pub delegates: Vec<DelegateInfo>,
}

// ── NodeHandle ──

/// Shared access to the node's operations. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    state: Arc<Mutex<NodeState>>,
    poll: Poll,
    keypair: Arc<SigningKeypair>,
    transport: Arc<dyn Transport>,
}

impl NodeHandle {
    /// Build the node state and spawn its poll on the current runtime.
    pub fn new(
        keypair: SigningKeypair,
        consensus: &ConsensusConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let schedule = consensus.schedule();
        let poll = Poll::spawn(consensus.poll_config(), schedule);
        let state = NodeState {
            chain: ChainState::new(consensus.block_reward, schedule),
            mempool: Mempool::with_defaults(),
        };
        NodeHandle {
            state: Arc::new(Mutex::new(state)),
            poll,
            keypair: Arc::new(keypair),
            transport,
        }
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    pub fn state(&self) -> Arc<Mutex<NodeState>> {
        Arc::clone(&self.state)
    }

    /// Units are accepted if created in the current slot (with tolerance)
    /// and not in the future.
    fn check_window(&self, timestamp: i64, now: i64) -> Result<(), NodeError> {
        let schedule = self.poll.schedule();
        let earliest = schedule.current_slot_start(now) - schedule.epsilon();
        let latest = now.saturating_add(schedule.epsilon());
        if timestamp <= earliest || timestamp > latest {
            return Err(NodeError::OutOfWindow {
                timestamp,
                earliest,
                latest,
            });
        }
        Ok(())
    }

    /// Verify and pool a transaction.
    pub async fn receive_transaction(&self, tx: Transaction, now: i64) -> Result<Hash, NodeError> {
        tx.verify()?;
        self.check_window(tx.unit.timestamp, now)?;
        let mut state = self.state.lock().await;
        let id = state.mempool.insert_transaction(tx)?;
        tracing::debug!(tx = %hex::encode(&id[..8]), "Transaction pooled");
        Ok(id)
    }

    /// Verify a vote, count it and pool it for the next block.
    pub async fn receive_vote(&self, vote: Vote, now: i64) -> Result<Hash, NodeError> {
        vote.verify()?;
        self.check_window(vote.unit.timestamp, now)?;
        self.poll.submit_vote(vote.clone());
        let mut state = self.state.lock().await;
        let id = state.mempool.insert_vote(vote)?;
        Ok(id)
    }

    /// Hand a block from `origin` to the chain. Pools are cleared whenever
    /// the head moves.
    ///
    /// Missing ancestors are fetched from `origin` before the node lock is
    /// taken; the lock is held only to validate and apply.
    pub async fn receive_block(
        &self,
        block: BlockData,
        origin: &PeerId,
        now: i64,
    ) -> Result<Received, NodeError> {
        let (known, at_genesis) = {
            let state = self.state.lock().await;
            let chain = &state.chain;
            (chain.contains(&block.hash), chain.head() == chain.genesis())
        };
        if known {
            return Ok(Received::Known);
        }
        if !at_genesis {
            self.poll
                .is_valid(&block, now)
                .await
                .map_err(ChainError::from)?;
        }

        let shared = &self.state;
        let branch = fork::fetch_branch(
            &block,
            self.poll.schedule(),
            origin,
            self.transport.as_ref(),
            |hash| async move { shared.lock().await.chain.contains(&hash) },
        )
        .await
        .map_err(ChainError::from)?;

        let mut state = self.state.lock().await;
        let received = state
            .chain
            .receive(block, origin, now, &self.poll, &branch)
            .await?;
        if received != Received::Known {
            state.mempool.clear();
        }
        Ok(received)
    }

    /// Build, attach and broadcast a block for the slot containing `now`.
    ///
    /// Pending transactions outside the block window or unaffordable in
    /// timestamp order are left out; every pending vote is included.
    pub async fn produce(&self, now: i64) -> Result<BlockData, NodeError> {
        let block = {
            let mut state = self.state.lock().await;
            let slot_start = self.poll.schedule().current_slot_start(now);
            let parent = &state.chain.head_block().data;
            let parent_ts = parent.unit.timestamp;
            let parent_hash = parent.hash;

            let in_window: Vec<Transaction> = state
                .mempool
                .transactions()
                .iter()
                .filter(|tx| tx.unit.timestamp >= parent_ts && tx.unit.timestamp <= slot_start)
                .cloned()
                .collect();
            let transactions = state.chain.ledger().collect_valid(&in_window, true);
            let votes = state.mempool.votes().to_vec();

            let block = BlockData::produce(
                &self.keypair,
                parent_hash,
                transactions,
                votes,
                state.chain.reward(),
                slot_start,
            );
            state.chain.attach(block.clone())?;
            state.mempool.clear();
            block
        };
        tracing::info!(
            block = %block.hash.short(),
            txs = block.transactions.len(),
            votes = block.votes.len(),
            "Produced block"
        );
        self.transport
            .broadcast(Message::NewBlock(Box::new(block.clone())))
            .await;
        Ok(block)
    }

    /// Sign a payment with the node key, pool it and broadcast it.
    pub async fn pay(&self, recipient: Identity, amount: u64) -> Result<Transaction, NodeError> {
        let now = crate::now_nanos();
        let tx = Transaction::pay(&self.keypair, recipient, amount, now);
        self.receive_transaction(tx.clone(), now).await?;
        self.transport
            .broadcast(Message::NewTransaction(tx.clone()))
            .await;
        Ok(tx)
    }

    /// Sign a vote with the node key, count it and broadcast it.
    pub async fn vote(&self, candidate: Identity) -> Result<Vote, NodeError> {
        let now = crate::now_nanos();
        let vote = Vote::new(&self.keypair, candidate, now);
        self.receive_vote(vote.clone(), now).await?;
        self.transport.broadcast(Message::NewVote(vote.clone())).await;
        Ok(vote)
    }

    pub async fn block(&self, hash: &BlockHash) -> Option<BlockData> {
        let state = self.state.lock().await;
        state.chain.block(hash).map(|b| b.data.clone())
    }

    pub async fn balance(&self, identity: &Identity) -> u64 {
        self.state.lock().await.chain.ledger().balance(identity)
    }

    pub async fn delegates(&self) -> Vec<DelegateInfo> {
        self.poll
            .top()
            .await
            .into_iter()
            .map(|(identity, votes)| DelegateInfo { identity, votes })
            .collect()
    }

    pub async fn status(&self) -> NodeStatus {
        let me = self.identity();
        let delegates = self.delegates().await;
        let position = self.poll.position(&me).await;
        let current_slot = self.poll.schedule().slot_at(crate::now_nanos());
        let state = self.state.lock().await;
        let head = state.chain.head_block();
        let pool = state.mempool.stats();
        NodeStatus {
            identity: me,
            head: head.data.hash.to_hex(),
            height: head.height,
            head_timestamp: head.data.unit.timestamp,
            pending_transactions: pool.transaction_count,
            pending_votes: pool.vote_count,
            current_slot,
            position,
            delegates,
        }
    }
}

// ── Node ──

/// Node configuration.
#[derive(Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,
    pub max_peers: usize,
    pub keypair: SigningKeypair,
    pub consensus: ConsensusConfig,
}

/// The node orchestrator.
pub struct Node {
    handle: NodeHandle,
    p2p: P2pHandle,
    event_rx: mpsc::Receiver<P2pEvent>,
    local_addr: SocketAddr,
    bootstrap_peers: Vec<SocketAddr>,
}

impl Node {
    /// Bind the P2P listener and set up node state.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let started = p2p::start(P2pConfig {
            listen_addr: config.listen_addr,
            max_peers: config.max_peers,
            keypair: config.keypair.clone(),
        })
        .await?;
        let transport: Arc<dyn Transport> = Arc::new(started.handle.clone());
        let handle = NodeHandle::new(config.keypair, &config.consensus, transport);
        tracing::info!(
            identity = %handle.identity(),
            listen = %started.local_addr,
            "Node initialized"
        );
        Ok(Node {
            handle,
            p2p: started.handle,
            event_rx: started.events,
            local_addr: started.local_addr,
            bootstrap_peers: config.bootstrap_peers,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn p2p_handle(&self) -> P2pHandle {
        self.p2p.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the main event loop until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        for addr in &self.bootstrap_peers {
            if let Err(e) = self.p2p.connect(*addr).await {
                tracing::warn!(peer = %addr, error = %e, "Failed to dial bootstrap peer");
            }
        }

        let mut triggers = poll::start_production(
            self.handle.poll().clone(),
            self.handle.identity(),
            shutdown.child_token(),
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received");
                    let _ = self.p2p.shutdown().await;
                    break;
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_p2p_event(event).await;
                }
                Some(slot_start) = triggers.recv() => {
                    tracing::debug!(slot_start, "Our slot started");
                    if let Err(e) = self.handle.produce(crate::now_nanos()).await {
                        tracing::warn!(error = %e, "Block production failed");
                    }
                }
            }
        }
        tracing::info!("Node stopped");
    }

    async fn handle_p2p_event(&mut self, event: P2pEvent) {
        match event {
            P2pEvent::MessageReceived { from, message } => {
                self.handle_message(from, *message).await;
            }
            P2pEvent::PeerConnected(peer_id) => {
                tracing::info!(peer = %peer_id.short(), "Peer connected");
            }
            P2pEvent::PeerDisconnected(peer_id) => {
                tracing::info!(peer = %peer_id.short(), "Peer disconnected");
            }
        }
    }

    async fn handle_message(&mut self, from: PeerId, message: Message) {
        let now = crate::now_nanos();
        match message {
            Message::NewTransaction(tx) => match self.handle.receive_transaction(tx.clone(), now).await {
                Ok(_) => {
                    let _ = self
                        .p2p
                        .broadcast_except(Message::NewTransaction(tx), Some(from))
                        .await;
                }
                Err(e) => tracing::debug!(error = %e, "Rejected transaction"),
            },
            Message::NewVote(vote) => match self.handle.receive_vote(vote.clone(), now).await {
                Ok(_) => {
                    let _ = self
                        .p2p
                        .broadcast_except(Message::NewVote(vote), Some(from))
                        .await;
                }
                Err(e) => tracing::debug!(error = %e, "Rejected vote"),
            },
            // Fork walks wait on peers; run them off the event loop so block
            // responses keep flowing.
            Message::NewBlock(block) => {
                let handle = self.handle.clone();
                let p2p = self.p2p.clone();
                tokio::spawn(async move {
                    let relay = Message::NewBlock(block.clone());
                    match handle.receive_block(*block, &from, now).await {
                        Ok(Received::Known) => {}
                        Ok(_) => {
                            let _ = p2p.broadcast_except(relay, Some(from)).await;
                        }
                        Err(e) => tracing::warn!(peer = %from.short(), error = %e, "Rejected block"),
                    }
                });
            }
            Message::GetBlock { request_id, hash } => {
                let handle = self.handle.clone();
                let p2p = self.p2p.clone();
                tokio::spawn(async move {
                    let block = handle.block(&hash).await.map(Box::new);
                    let _ = p2p
                        .send_to(from, Message::BlockResponse { request_id, block })
                        .await;
                });
            }
            Message::Hello { .. } | Message::HelloAck { .. } | Message::BlockResponse { .. } => {
                tracing::debug!(peer = %from.short(), "Ignoring unexpected message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TransportError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock};

    const SEC: i64 = crate::constants::NANOS_PER_SEC;

    /// Records broadcasts, serves nothing.
    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<Message>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn broadcast(&self, message: Message) {
            self.sent.lock().unwrap().push(message);
        }

        async fn request_block(
            &self,
            _peer: &PeerId,
            hash: BlockHash,
        ) -> Result<BlockData, TransportError> {
            Err(TransportError::BlockNotFound(hash))
        }
    }

    fn consensus() -> ConsensusConfig {
        ConsensusConfig {
            max_delegates: 1,
            max_votes_per_voter: 1,
            vote_freeze_period_ms: 0,
            ..ConsensusConfig::default()
        }
    }

    fn node() -> (NodeHandle, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let handle = NodeHandle::new(SigningKeypair::generate(), &consensus(), transport.clone());
        (handle, transport)
    }

    /// A time well inside some slot after genesis.
    fn mid_slot() -> i64 {
        crate::constants::GENESIS_TIMESTAMP + 1_000 * 10 * SEC + 4 * SEC
    }

    #[tokio::test]
    async fn transaction_window_enforced() {
        let (node, _) = node();
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let now = mid_slot();
        let slot_start = now - 4 * SEC;

        let fresh = Transaction::pay(&alice, bob.identity(), 1, now - SEC);
        assert!(node.receive_transaction(fresh.clone(), now).await.is_ok());
        assert!(matches!(
            node.receive_transaction(fresh, now).await,
            Err(NodeError::Mempool(MempoolError::Duplicate))
        ));

        let previous_slot = Transaction::pay(&alice, bob.identity(), 1, slot_start - 2 * SEC);
        assert!(matches!(
            node.receive_transaction(previous_slot, now).await,
            Err(NodeError::OutOfWindow { .. })
        ));

        let future = Transaction::pay(&alice, bob.identity(), 1, now + 2 * SEC);
        assert!(matches!(
            node.receive_transaction(future, now).await,
            Err(NodeError::OutOfWindow { .. })
        ));

        // Within epsilon before the slot start is still fine.
        let skewed = Transaction::pay(&alice, bob.identity(), 1, slot_start - SEC / 2);
        assert!(node.receive_transaction(skewed, now).await.is_ok());
    }

    #[tokio::test]
    async fn self_vote_rejected_before_counting() {
        let (node, _) = node();
        let kp = SigningKeypair::generate();
        let now = mid_slot();
        let vote = Vote::new(&kp, kp.identity(), now);
        assert!(matches!(
            node.receive_vote(vote, now).await,
            Err(NodeError::Invalid(SignableError::SelfVote))
        ));
        assert!(node.delegates().await.is_empty());
    }

    #[tokio::test]
    async fn received_vote_is_counted_and_pooled() {
        let (node, _) = node();
        let voter = SigningKeypair::generate();
        let now = mid_slot();
        node.receive_vote(Vote::new(&voter, node.identity(), now), now)
            .await
            .unwrap();
        assert_eq!(
            node.delegates().await,
            vec![DelegateInfo {
                identity: node.identity(),
                votes: 1
            }]
        );
        assert_eq!(node.status().await.pending_votes, 1);
    }

    #[tokio::test]
    async fn produce_attaches_and_broadcasts() {
        let (node, transport) = node();
        let now = mid_slot();
        let block = node.produce(now).await.unwrap();
        let schedule = node.poll().schedule();
        assert_eq!(block.unit.timestamp, schedule.current_slot_start(now));
        assert_eq!(node.balance(&node.identity()).await, block.reward);

        let status = node.status().await;
        assert_eq!(status.height, 1);
        assert_eq!(status.head, block.hash.to_hex());
        assert!(node.block(&block.hash).await.is_some());

        let sent = transport.sent.lock().unwrap();
        assert!(matches!(sent.last(), Some(Message::NewBlock(b)) if b.hash == block.hash));
    }

    #[tokio::test]
    async fn produce_skips_unaffordable_and_clears_pool() {
        let (node, _) = node();
        let now = mid_slot();
        // Earn one reward first, one slot earlier.
        node.produce(now - 10 * SEC).await.unwrap();
        let reward = node.balance(&node.identity()).await;

        let bob = SigningKeypair::generate();
        let me = &node.keypair;
        let affordable = Transaction::pay(me, bob.identity(), reward, now - 9 * SEC);
        let overdraft = Transaction::pay(me, bob.identity(), 1, now - 8 * SEC);
        // Pool directly: these timestamps belong to the previous slot.
        {
            let state = node.state();
            let mut state = state.lock().await;
            state.mempool.insert_transaction(overdraft).unwrap();
            state.mempool.insert_transaction(affordable.clone()).unwrap();
        }

        let block = node.produce(now + 6 * SEC).await.unwrap();
        assert_eq!(block.transactions, vec![affordable]);
        assert_eq!(node.balance(&bob.identity()).await, reward);
        assert_eq!(node.status().await.pending_transactions, 0);
    }

    #[tokio::test]
    async fn second_production_in_same_slot_fails() {
        let (node, _) = node();
        let now = mid_slot();
        node.produce(now).await.unwrap();
        assert!(matches!(
            node.produce(now + SEC).await,
            Err(NodeError::Chain(ChainError::Block(
                crate::block::BlockError::NotAfterParent { .. }
            )))
        ));
        assert_eq!(node.status().await.height, 1);
    }

    #[tokio::test]
    async fn pay_broadcasts_signed_transaction() {
        let (node, transport) = node();
        let bob = SigningKeypair::generate();
        let tx = node.pay(bob.identity(), 3).await.unwrap();
        assert_eq!(tx.sender(), &node.identity());
        assert_eq!(node.status().await.pending_transactions, 1);
        let sent = transport.sent.lock().unwrap();
        assert!(matches!(sent.last(), Some(Message::NewTransaction(t)) if *t == tx));
    }

    #[tokio::test]
    async fn vote_broadcasts_and_counts() {
        let (node, transport) = node();
        let candidate = SigningKeypair::generate();
        node.vote(candidate.identity()).await.unwrap();
        assert_eq!(node.poll().votes(&candidate.identity()).await, 1);
        assert!(matches!(
            transport.sent.lock().unwrap().last(),
            Some(Message::NewVote(_))
        ));
    }

    /// Serves a fixed set of blocks and notes whether the node lock was
    /// held while one was requested.
    #[derive(Default)]
    struct ServingTransport {
        blocks: HashMap<BlockHash, BlockData>,
        node_state: OnceLock<Arc<Mutex<NodeState>>>,
        requests: AtomicUsize,
        requested_under_lock: AtomicBool,
    }

    #[async_trait]
    impl Transport for ServingTransport {
        async fn broadcast(&self, _message: Message) {}

        async fn request_block(
            &self,
            _peer: &PeerId,
            hash: BlockHash,
        ) -> Result<BlockData, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(state) = self.node_state.get() {
                if state.try_lock().is_err() {
                    self.requested_under_lock.store(true, Ordering::SeqCst);
                }
            }
            self.blocks
                .get(&hash)
                .cloned()
                .ok_or(TransportError::BlockNotFound(hash))
        }
    }

    #[tokio::test]
    async fn missing_ancestors_fetched_without_node_lock() {
        let first = SigningKeypair::generate();
        let second = SigningKeypair::generate();
        let genesis = crate::block::genesis_hash();
        let reward = crate::constants::DEFAULT_BLOCK_REWARD;
        let start = crate::constants::GENESIS_TIMESTAMP;
        let b1 = BlockData::produce(&first, genesis, vec![], vec![], reward, start + 10 * SEC);
        let b2 = BlockData::produce(&second, b1.hash, vec![], vec![], reward, start + 20 * SEC);

        let transport = Arc::new(ServingTransport {
            blocks: HashMap::from([(b1.hash, b1.clone())]),
            ..ServingTransport::default()
        });
        let node = NodeHandle::new(SigningKeypair::generate(), &consensus(), transport.clone());
        assert!(transport.node_state.set(node.state()).is_ok());

        let origin = PeerId::from("origin");
        let received = node.receive_block(b2.clone(), &origin, mid_slot()).await.unwrap();
        let switch = match received {
            Received::Switched(switch) => switch,
            other => panic!("expected fork switch, got {:?}", other),
        };
        assert_eq!(switch.adopted, vec![b1.hash, b2.hash]);
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);
        assert!(!transport.requested_under_lock.load(Ordering::SeqCst));
        assert_eq!(node.status().await.height, 2);
        assert_eq!(node.balance(&first.identity()).await, reward);
    }
}
