pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;
pub type CorrelationId = u64;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// How a member takes part in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRole {
    /// Counts toward every quorum
    Voting,
    /// Receives the log but never votes
    NonVoting,
    /// Admitted by a join, replicating until it is promoted to `Voting`
    Joining,
}

impl MemberRole {
    pub fn id(self) -> u8 {
        match self {
            MemberRole::Voting => 1,
            MemberRole::NonVoting => 2,
            MemberRole::Joining => 3,
        }
    }

    pub fn for_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(MemberRole::Voting),
            2 => Some(MemberRole::NonVoting),
            3 => Some(MemberRole::Joining),
            _ => None,
        }
    }
}

/// A server taking part in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub address: String,
    pub role: MemberRole,
}

impl Member {
    pub fn new(id: NodeId, address: impl Into<String>, role: MemberRole) -> Self {
        Self {
            id,
            address: address.into(),
            role,
        }
    }

    pub fn voting(id: NodeId, address: impl Into<String>) -> Self {
        Self::new(id, address, MemberRole::Voting)
    }

    pub fn is_voting(&self) -> bool {
        self.role == MemberRole::Voting
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}({:?})", self.id, self.address, self.role)
    }
}

/// Cluster membership as recorded in the log.
///
/// `members` is the incoming membership. While a change is in progress
/// `outgoing` holds the voting members of the previous configuration and
/// every decision needs a majority of both sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub members: Vec<Member>,
    #[serde(default)]
    pub outgoing: Option<Vec<Member>>,
}

impl Configuration {
    /// Create a stable configuration, members ordered by id
    pub fn new(mut members: Vec<Member>) -> Self {
        members.sort_by_key(|m| m.id);
        members.dedup_by_key(|m| m.id);
        Self {
            members,
            outgoing: None,
        }
    }

    pub fn is_joint(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Voting members of the incoming configuration
    pub fn voters(&self) -> BTreeSet<NodeId> {
        self.members
            .iter()
            .filter(|m| m.is_voting())
            .map(|m| m.id)
            .collect()
    }

    /// Voting members of the outgoing configuration, if joint
    pub fn outgoing_voters(&self) -> Option<BTreeSet<NodeId>> {
        self.outgoing
            .as_ref()
            .map(|members| members.iter().map(|m| m.id).collect())
    }

    /// One voter set when stable, `[incoming, outgoing]` when joint
    pub fn voter_sets(&self) -> Vec<BTreeSet<NodeId>> {
        let mut sets = vec![self.voters()];
        if let Some(outgoing) = self.outgoing_voters() {
            sets.push(outgoing);
        }
        sets
    }

    /// Whether `id` votes in either configuration
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voter_sets().iter().any(|set| set.contains(&id))
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Whether `id` appears in the incoming or outgoing configuration
    pub fn contains(&self, id: NodeId) -> bool {
        self.all_members().iter().any(|m| m.id == id)
    }

    /// Every member of either configuration, incoming first
    pub fn all_members(&self) -> Vec<&Member> {
        let mut all: Vec<&Member> = self.members.iter().collect();
        if let Some(outgoing) = &self.outgoing {
            for member in outgoing {
                if !all.iter().any(|m| m.id == member.id) {
                    all.push(member);
                }
            }
        }
        all
    }

    /// First member still catching up after a join
    pub fn joining(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.role == MemberRole::Joining)
    }

    /// Stable configuration with `member` added
    pub fn with_member(&self, member: Member) -> Self {
        let mut members = self.members.clone();
        members.retain(|m| m.id != member.id);
        members.push(member);
        Self::new(members)
    }

    /// Stable configuration with `id` removed
    pub fn without_member(&self, id: NodeId) -> Self {
        let mut members = self.members.clone();
        members.retain(|m| m.id != id);
        Self::new(members)
    }

    /// Joint configuration moving from the current voters to `next`
    pub fn enter_joint(&self, next: &Configuration) -> Self {
        let outgoing = self
            .members
            .iter()
            .filter(|m| m.is_voting())
            .cloned()
            .collect();
        Self {
            members: next.members.clone(),
            outgoing: Some(outgoing),
        }
    }

    /// Stable configuration made of the incoming members only
    pub fn leave_joint(&self) -> Self {
        Self::new(self.members.clone())
    }

    /// Copy of the configuration with `id` given `role`
    pub fn with_role(&self, id: NodeId, role: MemberRole) -> Self {
        let mut members = self.members.clone();
        for member in members.iter_mut().filter(|m| m.id == id) {
            member.role = role;
        }
        Self {
            members,
            outgoing: self.outgoing.clone(),
        }
    }
}

/// Kind of a log entry, determines how it is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Command,       // Applied to the state machine
    Configuration, // Encoded cluster configuration
    Noop,          // Appended by a new leader
}

impl LogEntryType {
    pub fn id(self) -> u8 {
        match self {
            LogEntryType::Command => 1,
            LogEntryType::Configuration => 2,
            LogEntryType::Noop => 3,
        }
    }

    pub fn for_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(LogEntryType::Command),
            2 => Some(LogEntryType::Configuration),
            3 => Some(LogEntryType::Noop),
            _ => None,
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub timestamp: u64, // Leader wall clock (ms) at append
    pub entry_type: LogEntryType,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(
        index: LogIndex,
        term: Term,
        timestamp: u64,
        entry_type: LogEntryType,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            index,
            term,
            timestamp,
            entry_type,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Configuration {
        Configuration::new(vec![
            Member::voting(3, "10.0.0.3:7000"),
            Member::voting(1, "10.0.0.1:7000"),
            Member::voting(2, "10.0.0.2:7000"),
        ])
    }

    #[test]
    fn test_members_are_ordered_by_id() {
        let cfg = three();
        let ids: Vec<NodeId> = cfg.members.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(!cfg.is_joint());
        assert_eq!(cfg.voter_sets().len(), 1);
    }

    #[test]
    fn test_joining_member_does_not_vote() {
        let cfg = three().with_member(Member::new(4, "10.0.0.4:7000", MemberRole::Joining));
        assert_eq!(cfg.voters(), BTreeSet::from([1, 2, 3]));
        assert_eq!(cfg.joining().map(|m| m.id), Some(4));
        assert!(!cfg.is_voter(4));
        assert!(cfg.contains(4));
    }

    #[test]
    fn test_enter_and_leave_joint() {
        let old = three();
        let next = old.without_member(3);
        let joint = old.enter_joint(&next);

        assert!(joint.is_joint());
        assert_eq!(joint.voters(), BTreeSet::from([1, 2]));
        assert_eq!(joint.outgoing_voters(), Some(BTreeSet::from([1, 2, 3])));
        // the departing member is still reachable while joint
        assert!(joint.contains(3));
        assert!(joint.is_voter(3));
        assert_eq!(joint.all_members().len(), 3);

        let stable = joint.leave_joint();
        assert!(!stable.is_joint());
        assert!(!stable.contains(3));
    }

    #[test]
    fn test_role_ids_are_closed() {
        for role in [MemberRole::Voting, MemberRole::NonVoting, MemberRole::Joining] {
            assert_eq!(MemberRole::for_id(role.id()), Some(role));
        }
        assert_eq!(MemberRole::for_id(0), None);
        assert_eq!(LogEntryType::for_id(9), None);
    }

    #[test]
    fn test_configuration_json() {
        let json = serde_json::to_string(&three()).unwrap();
        let decoded: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, three());
    }
}
