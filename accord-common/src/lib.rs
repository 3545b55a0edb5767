pub mod config;
pub mod error;
pub mod types;

pub use config::{load_config, ClusterConfig, RaftConfig};
pub use error::{AccordError, Result};
pub use types::{
    Configuration, CorrelationId, LogEntry, LogEntryType, LogIndex, Member, MemberRole, NodeId,
    Term,
};
