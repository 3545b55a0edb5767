//! Raft consensus with joint-consensus membership changes, served over a
//! compact binary protocol.
pub mod protocol;
pub mod raft;

pub use raft::{spawn, NodeHandle, NodeStatus, RaftNode, Transport};
