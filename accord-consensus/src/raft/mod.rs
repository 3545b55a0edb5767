// Raft consensus core & membership changes
pub mod cluster;
pub mod driver;
pub mod log;
pub mod node;
pub mod progress;
pub mod quorum;
pub mod state_machine;
pub mod timer;

mod election;
mod membership;
mod replication;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{spawn, NodeHandle, Transport};
pub use log::{LogStore, MemLog};
pub use node::{Completion, NodeRole, NodeStatus, Output, RaftNode, Ticket};
pub use state_machine::{ApplyError, KeyValueStore, KvCommand, KvQuery, KvResponse, StateMachine};
