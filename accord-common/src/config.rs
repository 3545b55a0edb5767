use crate::error::{AccordError, Result};
use crate::types::{Configuration, Member, NodeId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Static configuration of one cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub address: String,
    /// Bootstrap membership. Empty for a node that will join a live cluster.
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub raft: RaftConfig,
}

/// Protocol timing and batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Granularity of the node's logical clock.
    pub tick_interval_ms: u64,
    /// Election timeout range (min, max); a random value is drawn per election.
    pub election_timeout_ms: (u64, u64),
    /// Leader heartbeat interval, should be well below the election timeout.
    pub heartbeat_interval_ms: u64,
    /// Upper bound on a single outbound RPC.
    pub rpc_timeout_ms: u64,
    pub max_entries_per_append: u64,
    /// Cap on the retry backoff for an unreachable follower.
    pub max_backoff_ms: u64,
    /// A joining member counts as caught up within this many entries of the leader.
    pub catch_up_lag: u64,
    /// Give up on a joining member that has not caught up after this long.
    pub join_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            election_timeout_ms: (150, 300),
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            max_entries_per_append: 64,
            max_backoff_ms: 1_000,
            catch_up_lag: 8,
            join_timeout_ms: 10_000,
        }
    }
}

impl RaftConfig {
    fn ticks(&self, ms: u64) -> u64 {
        (ms / self.tick_interval_ms.max(1)).max(1)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Election timeout range in ticks
    pub fn election_ticks(&self) -> (u64, u64) {
        let (min, max) = self.election_timeout_ms;
        (self.ticks(min), self.ticks(max))
    }

    pub fn heartbeat_ticks(&self) -> u64 {
        self.ticks(self.heartbeat_interval_ms)
    }

    pub fn max_backoff_ticks(&self) -> u64 {
        self.ticks(self.max_backoff_ms)
    }

    pub fn join_timeout_ticks(&self) -> u64 {
        self.ticks(self.join_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let (min, max) = self.election_timeout_ms;
        if self.tick_interval_ms == 0 {
            return Err(AccordError::Config("tick_interval_ms must be > 0".into()));
        }
        if min == 0 || min > max {
            return Err(AccordError::Config(format!(
                "invalid election_timeout_ms range ({}, {})",
                min, max
            )));
        }
        if self.heartbeat_interval_ms >= min / 2 {
            return Err(AccordError::Config(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.heartbeat_interval_ms, min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(AccordError::Config(
                "max_entries_per_append must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl ClusterConfig {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            members: Vec::new(),
            raft: RaftConfig::default(),
        }
    }

    /// Bootstrap membership as a stable configuration
    pub fn bootstrap(&self) -> Configuration {
        Configuration::new(self.members.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(AccordError::Config("address is required".into()));
        }
        for member in &self.members {
            if self.members.iter().filter(|m| m.id == member.id).count() > 1 {
                return Err(AccordError::Config(format!(
                    "member {} is listed more than once",
                    member.id
                )));
            }
        }
        self.raft.validate()
    }
}

/// Loads a node configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}
