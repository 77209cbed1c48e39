//! Slot arithmetic.
//!
//! Time since genesis is cut into slots of `slot_period` nanoseconds; every
//! `max_delegates` consecutive slots form a round. The delegate at position
//! `i` of the top list owns slot `i` of every round.

use std::time::Duration;

/// Slot timing parameters. All values in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    genesis: i64,
    slot_period: i64,
    max_delegates: usize,
    epsilon: i64,
}

impl Schedule {
    /// Non-positive periods and a zero delegate count are raised to one.
    pub fn new(genesis: i64, slot_period: i64, max_delegates: usize, epsilon: i64) -> Self {
        Schedule {
            genesis,
            slot_period: slot_period.max(1),
            max_delegates: max_delegates.max(1),
            epsilon: epsilon.max(0),
        }
    }

    pub fn genesis(&self) -> i64 {
        self.genesis
    }

    pub fn slot_period(&self) -> i64 {
        self.slot_period
    }

    pub fn max_delegates(&self) -> usize {
        self.max_delegates
    }

    pub fn epsilon(&self) -> i64 {
        self.epsilon
    }

    /// Length of a full round.
    pub fn round_duration(&self) -> i64 {
        self.slot_period.saturating_mul(self.max_delegates as i64)
    }

    /// Index of the slot, within its round, that contains `ts`.
    pub fn slot_at(&self, ts: i64) -> usize {
        let offset = ts.wrapping_sub(self.genesis).rem_euclid(self.round_duration());
        (offset / self.slot_period) as usize
    }

    /// Start of the slot containing `ts`.
    pub fn current_slot_start(&self, ts: i64) -> i64 {
        ts - ts.wrapping_sub(self.genesis).rem_euclid(self.slot_period)
    }

    pub fn next_slot_start(&self, ts: i64) -> i64 {
        self.current_slot_start(ts).saturating_add(self.slot_period)
    }

    /// Time left until the next slot boundary.
    pub fn until_next_slot(&self, now: i64) -> Duration {
        let remaining = self.next_slot_start(now).saturating_sub(now).max(0);
        Duration::from_nanos(remaining as u64)
    }

    /// Whether `a` and `b` are closer than the clock tolerance.
    pub fn within_epsilon(&self, a: i64, b: i64) -> bool {
        a.abs_diff(b) < self.epsilon as u64
    }
}
