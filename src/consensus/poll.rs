//! Delegate election.
//!
//! [`Tally`] is the pure vote-counting state machine. [`Poll`] wraps it in a
//! tokio task that owns the tally outright: votes, round resets and queries
//! all travel through one command queue, so every query observes every
//! command sent before it on the same handle and no lock is ever shared.
//!
//! The rules:
//! - a voter backs at most `max_votes_per_voter` candidates; backing one more
//!   evicts (and retracts the vote from) the oldest;
//! - votes of one voter closer together than `vote_freeze_period` are ignored,
//!   as are repeat votes for a candidate the voter already backs;
//! - the top list holds the `max_delegates` best supported candidates,
//!   highest first, ties kept in the order they reached their tally.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::schedule::Schedule;
use crate::block::BlockData;
use crate::crypto::keys::Identity;
use crate::vote::Vote;

/// Election parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub max_delegates: usize,
    pub max_votes_per_voter: usize,
    /// Nanoseconds.
    pub vote_freeze_period: i64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            max_delegates: crate::constants::DEFAULT_MAX_DELEGATES,
            max_votes_per_voter: crate::constants::DEFAULT_MAX_VOTES_PER_VOTER,
            vote_freeze_period: crate::constants::DEFAULT_VOTE_FREEZE_PERIOD_NS,
        }
    }
}

/// Slot/timing rejections of an incoming block.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("producer {producer} is not in required slot {slot} (position {position:?})")]
    WrongSlot {
        producer: Identity,
        slot: usize,
        position: Option<usize>,
    },
    #[error("block timestamp {found} too far from slot start {required}")]
    StaleTimestamp { required: i64, found: i64 },
}

/// What happened to a submitted vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    Counted,
    /// The voter's previous vote is too recent.
    Frozen,
    /// The voter already backs this candidate.
    Repeated,
}

/// Per-identity record. Voters use `voted_for`/`last_vote_timestamp`;
/// candidates use `votes`. One identity can be both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoterInfo {
    pub votes: u64,
    pub voted_for: VecDeque<Identity>,
    pub last_vote_timestamp: Option<i64>,
}

// ── Tally ──

/// Vote counts and the ranked top list.
#[derive(Clone, Debug)]
pub struct Tally {
    config: PollConfig,
    records: HashMap<Identity, VoterInfo>,
    top: Vec<(Identity, u64)>,
}

impl Tally {
    /// Both caps are clamped to at least one: a zero vote cap would count a
    /// vote and evict it in the same step.
    pub fn new(config: PollConfig) -> Self {
        Tally {
            config: PollConfig {
                max_delegates: config.max_delegates.max(1),
                max_votes_per_voter: config.max_votes_per_voter.max(1),
                ..config
            },
            records: HashMap::new(),
            top: Vec::with_capacity(config.max_delegates.max(1)),
        }
    }

    pub fn process_vote(&mut self, vote: &Vote) -> VoteOutcome {
        let voter = vote.voter().clone();
        let candidate = vote.candidate.clone();
        let ts = vote.unit.timestamp;

        let info = self.records.entry(voter).or_default();
        if let Some(last) = info.last_vote_timestamp {
            if ts.saturating_sub(last) < self.config.vote_freeze_period {
                return VoteOutcome::Frozen;
            }
        }
        if info.voted_for.contains(&candidate) {
            return VoteOutcome::Repeated;
        }

        info.voted_for.push_back(candidate.clone());
        let evicted = if info.voted_for.len() > self.config.max_votes_per_voter {
            info.voted_for.pop_front()
        } else {
            None
        };
        info.last_vote_timestamp = Some(ts);

        if let Some(old) = evicted {
            self.adjust(&old, -1);
        }
        self.adjust(&candidate, 1);
        VoteOutcome::Counted
    }

    /// Apply a tally delta to `candidate` and re-rank it.
    pub fn adjust(&mut self, candidate: &Identity, delta: i64) {
        let record = self.records.entry(candidate.clone()).or_default();
        record.votes = if delta >= 0 {
            record.votes.saturating_add(delta as u64)
        } else {
            record.votes.saturating_sub(delta.unsigned_abs())
        };
        self.update_top(candidate);
    }

    fn update_top(&mut self, candidate: &Identity) {
        let votes = self.votes(candidate);
        let was_member = match self.top.iter().position(|(id, _)| id == candidate) {
            Some(pos) => {
                self.top.remove(pos);
                true
            }
            None => false,
        };

        if votes > 0 {
            self.offer(candidate.clone(), votes);
        }

        // A member that lost votes may now rank below an outsider.
        if was_member {
            if let Some((id, v)) = self.best_outsider() {
                self.offer(id, v);
            }
        }
    }

    /// Insert into the top list if there is room or `votes` beats the lowest member.
    fn offer(&mut self, candidate: Identity, votes: u64) {
        let full = self.top.len() >= self.config.max_delegates;
        if full {
            match self.top.last() {
                Some((_, lowest)) if votes > *lowest => {}
                _ => return,
            }
        }
        let pos = self.top.partition_point(|(_, v)| *v >= votes);
        self.top.insert(pos, (candidate, votes));
        self.top.truncate(self.config.max_delegates);
    }

    fn best_outsider(&self) -> Option<(Identity, u64)> {
        self.records
            .iter()
            .filter(|(id, info)| info.votes > 0 && !self.top.iter().any(|(t, _)| t == *id))
            .max_by(|(a_id, a), (b_id, b)| a.votes.cmp(&b.votes).then_with(|| b_id.cmp(a_id)))
            .map(|(id, info)| (id.clone(), info.votes))
    }

    fn min_votes(&self) -> u64 {
        if self.top.len() >= self.config.max_delegates {
            self.top.last().map(|(_, v)| *v).unwrap_or(0)
        } else {
            0
        }
    }

    pub fn votes(&self, candidate: &Identity) -> u64 {
        self.records.get(candidate).map(|r| r.votes).unwrap_or(0)
    }

    pub fn is_elected(&self, candidate: &Identity) -> bool {
        !self.top.is_empty() && self.votes(candidate) >= self.min_votes()
    }

    /// Index of `candidate` in the top list, if elected and listed.
    pub fn position(&self, candidate: &Identity) -> Option<usize> {
        if !self.is_elected(candidate) {
            return None;
        }
        self.top.iter().position(|(id, _)| id == candidate)
    }

    pub fn top(&self) -> &[(Identity, u64)] {
        &self.top
    }

    pub fn record(&self, identity: &Identity) -> Option<&VoterInfo> {
        self.records.get(identity)
    }

    pub fn new_round(&mut self) {
        self.records.clear();
        self.top.clear();
    }
}

// ── Poll actor ──

enum PollCommand {
    SubmitVote(Box<Vote>),
    StartNewRound,
    Position(Identity, oneshot::Sender<Option<usize>>),
    IsElected(Identity, oneshot::Sender<bool>),
    Votes(Identity, oneshot::Sender<u64>),
    Record(Identity, oneshot::Sender<Option<VoterInfo>>),
    Top(oneshot::Sender<Vec<(Identity, u64)>>),
}

/// Handle to the election actor. Cheap to clone.
///
/// The actor lives until the last handle is dropped.
#[derive(Clone)]
pub struct Poll {
    command_tx: mpsc::UnboundedSender<PollCommand>,
    schedule: Schedule,
}

impl Poll {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(config: PollConfig, schedule: Schedule) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_loop(Tally::new(config), command_rx));
        Poll {
            command_tx,
            schedule,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Queue a vote for counting. Never blocks.
    pub fn submit_vote(&self, vote: Vote) {
        let _ = self.command_tx.send(PollCommand::SubmitVote(Box::new(vote)));
    }

    /// Clear all votes and the top list.
    pub fn start_new_round(&self) {
        let _ = self.command_tx.send(PollCommand::StartNewRound);
    }

    pub async fn position(&self, candidate: &Identity) -> Option<usize> {
        self.query(|tx| PollCommand::Position(candidate.clone(), tx))
            .await
            .flatten()
    }

    pub async fn is_elected(&self, candidate: &Identity) -> bool {
        self.query(|tx| PollCommand::IsElected(candidate.clone(), tx))
            .await
            .unwrap_or(false)
    }

    pub async fn votes(&self, candidate: &Identity) -> u64 {
        self.query(|tx| PollCommand::Votes(candidate.clone(), tx))
            .await
            .unwrap_or(0)
    }

    pub async fn record(&self, identity: &Identity) -> Option<VoterInfo> {
        self.query(|tx| PollCommand::Record(identity.clone(), tx))
            .await
            .flatten()
    }

    pub async fn top(&self) -> Vec<(Identity, u64)> {
        self.query(PollCommand::Top).await.unwrap_or_default()
    }

    /// Check that `block` comes from the delegate owning the slot active at
    /// `received_at`, and that it is stamped at that slot's start.
    pub async fn is_valid(&self, block: &BlockData, received_at: i64) -> Result<(), SlotError> {
        let slot = self.schedule.slot_at(received_at);
        let position = self.position(block.producer()).await;
        if position != Some(slot) {
            return Err(SlotError::WrongSlot {
                producer: block.producer().clone(),
                slot,
                position,
            });
        }
        let required = self.schedule.current_slot_start(received_at);
        if !self.schedule.within_epsilon(required, block.unit.timestamp) {
            return Err(SlotError::StaleTimestamp {
                required,
                found: block.unit.timestamp,
            });
        }
        Ok(())
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> PollCommand) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(make(tx)).ok()?;
        rx.await.ok()
    }
}

async fn poll_loop(mut tally: Tally, mut command_rx: mpsc::UnboundedReceiver<PollCommand>) {
    while let Some(cmd) = command_rx.recv().await {
        match cmd {
            PollCommand::SubmitVote(vote) => {
                let outcome = tally.process_vote(&vote);
                tracing::debug!(
                    voter = %vote.voter().short(),
                    candidate = %vote.candidate.short(),
                    outcome = ?outcome,
                    "Vote processed"
                );
            }
            PollCommand::StartNewRound => {
                tally.new_round();
                tracing::info!("New election round started");
            }
            PollCommand::Position(id, reply) => {
                let _ = reply.send(tally.position(&id));
            }
            PollCommand::IsElected(id, reply) => {
                let _ = reply.send(tally.is_elected(&id));
            }
            PollCommand::Votes(id, reply) => {
                let _ = reply.send(tally.votes(&id));
            }
            PollCommand::Record(id, reply) => {
                let _ = reply.send(tally.record(&id).cloned());
            }
            PollCommand::Top(reply) => {
                let _ = reply.send(tally.top().to_vec());
            }
        }
    }
}

/// Emit the slot start time whenever a slot owned by `me` begins.
///
/// Sleeps holding no locks. Stops on cancellation or when the receiver is
/// dropped.
pub fn start_production(
    poll: Poll,
    me: Identity,
    shutdown: CancellationToken,
) -> mpsc::Receiver<i64> {
    let (trigger_tx, trigger_rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let schedule = *poll.schedule();
        loop {
            let wait = schedule.until_next_slot(crate::now_nanos());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = trigger_tx.closed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let now = crate::now_nanos();
            let slot = schedule.slot_at(now);
            if poll.position(&me).await == Some(slot) {
                tracing::debug!(slot, "Production slot started");
                if trigger_tx.send(schedule.current_slot_start(now)).await.is_err() {
                    break;
                }
            }
        }
    });
    trigger_rx
}
