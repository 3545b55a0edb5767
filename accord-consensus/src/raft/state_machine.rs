use accord_common::types::LogIndex;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Failure reported by a state machine, surfaced to the caller as an
/// application error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<bincode::Error> for ApplyError {
    fn from(err: bincode::Error) -> Self {
        ApplyError::Malformed(err.to_string())
    }
}

/// Trait for any Raft-compatible state machine.
/// Commands and queries are opaque bytes to the consensus core.
pub trait StateMachine: Send + 'static {
    /// Applies a committed command, called once per index in index order
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Bytes, ApplyError>;

    /// Reads state without modifying it
    fn query(&self, query: &[u8]) -> Result<Bytes, ApplyError>;
}

//
// Example Implementation: In-Memory Key-Value Store
//

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set(String, String),
    Delete(String),
}

/// Reads served by the key-value store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvQuery {
    Get(String),
    Len,
}

/// Response type returned by the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvResponse {
    Value(Option<String>),
    Len(usize),
    Ack,
}

impl KvCommand {
    pub fn to_bytes(&self) -> Result<Bytes, ApplyError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }
}

impl KvQuery {
    pub fn to_bytes(&self) -> Result<Bytes, ApplyError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }
}

impl KvResponse {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ApplyError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// The in-memory key-value store with Raft StateMachine trait
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
    applied: Vec<LogIndex>,
}

impl KeyValueStore {
    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    /// Indexes applied so far, in application order
    pub fn applied(&self) -> &[LogIndex] {
        &self.applied
    }

    fn respond(response: &KvResponse) -> Result<Bytes, ApplyError> {
        Ok(Bytes::from(bincode::serialize(response)?))
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Bytes, ApplyError> {
        self.applied.push(index);
        let command: KvCommand = bincode::deserialize(command)?;
        match command {
            KvCommand::Set(k, v) => {
                if k.is_empty() {
                    return Err(ApplyError::Rejected("empty key".into()));
                }
                self.data.insert(k, v);
                Self::respond(&KvResponse::Ack)
            }
            KvCommand::Delete(k) => {
                self.data.remove(&k);
                Self::respond(&KvResponse::Ack)
            }
        }
    }

    fn query(&self, query: &[u8]) -> Result<Bytes, ApplyError> {
        let query: KvQuery = bincode::deserialize(query)?;
        match query {
            KvQuery::Get(k) => Self::respond(&KvResponse::Value(self.data.get(&k).cloned())),
            KvQuery::Len => Self::respond(&KvResponse::Len(self.data.len())),
        }
    }
}
