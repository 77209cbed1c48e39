//! The running node: orchestration, pending pools and the HTTP API.

pub mod core;
pub mod mempool;
pub mod rpc;

pub use self::core::{DelegateInfo, Node, NodeConfig, NodeError, NodeHandle, NodeState, NodeStatus};
