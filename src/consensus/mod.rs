//! # Delegated proof of stake
//!
//! Block production rights rotate through a small, elected set of delegates.
//!
//! ```text
//!   votes ──► Poll (tally + top list) ──► position of each delegate
//!                                              │
//!   wall clock ──► Schedule (slot_at) ─────────┤
//!                                              ▼
//!                        block accepted only if producer position == slot
//! ```
//!
//! - [`poll`] counts weighted votes and maintains the top `max_delegates`
//!   candidates. It runs as a single actor task fed by a command queue.
//! - [`schedule`] maps timestamps onto slots of a repeating round anchored
//!   at genesis.
//! - [`chain`] is the block arena and the attach path; [`fork`] walks a
//!   competing branch back to the common ancestor and switches to it when it
//!   is longer.

pub mod chain;
pub mod fork;
pub mod poll;
pub mod schedule;
