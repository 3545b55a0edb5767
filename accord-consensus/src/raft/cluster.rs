use super::log::LogStore;
use super::quorum::QuorumSet;
use crate::protocol::codec::from_bytes;
use accord_common::error::Result;
use accord_common::types::{Configuration, LogEntryType, LogIndex, Member, NodeId};
use std::collections::BTreeSet;

/// The membership a node currently acts on.
///
/// A configuration is in force from the moment its entry is appended,
/// committed or not. `index` is 0 while the bootstrap configuration
/// applies.
#[derive(Debug, Clone)]
pub struct ClusterView {
    bootstrap: Configuration,
    current: Configuration,
    index: LogIndex,
}

impl ClusterView {
    pub fn new(bootstrap: Configuration) -> Self {
        Self {
            current: bootstrap.clone(),
            bootstrap,
            index: 0,
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.current
    }

    /// Log index of the active configuration entry
    pub fn index(&self) -> LogIndex {
        self.index
    }

    pub fn is_committed(&self, commit_index: LogIndex) -> bool {
        self.index <= commit_index
    }

    pub fn update(&mut self, index: LogIndex, configuration: Configuration) {
        self.index = index;
        self.current = configuration;
    }

    /// Re-derive the active configuration from the newest configuration
    /// entry left in the log, falling back to the bootstrap configuration.
    pub fn rebuild<S: LogStore>(&mut self, log: &S) -> Result<()> {
        let mut index = log.last_index();
        while index > 0 {
            if let Some(entry) = log.entry(index) {
                if entry.entry_type == LogEntryType::Configuration {
                    let configuration: Configuration = from_bytes(entry.data)?;
                    self.update(index, configuration);
                    return Ok(());
                }
            }
            index -= 1;
        }
        self.update(0, self.bootstrap.clone());
        Ok(())
    }

    pub fn voter_sets(&self) -> Vec<BTreeSet<NodeId>> {
        self.current.voter_sets()
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.current.is_voter(id)
    }

    /// Whether `ids` hold a majority of every active voter set
    pub fn is_quorum<'a, I>(&self, ids: I) -> bool
    where
        I: Iterator<Item = &'a NodeId> + Clone,
    {
        self.voter_sets().is_quorum(ids)
    }

    /// Every member that must receive the log, except `self_id`
    pub fn replication_targets(&self, self_id: NodeId) -> Vec<Member> {
        self.current
            .all_members()
            .into_iter()
            .filter(|m| m.id != self_id)
            .cloned()
            .collect()
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.current.all_members().into_iter().find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::to_bytes;
    use crate::raft::log::MemLog;
    use accord_common::types::{LogEntry, MemberRole};

    fn abc() -> Configuration {
        Configuration::new(vec![
            Member::voting(1, "a"),
            Member::voting(2, "b"),
            Member::voting(3, "c"),
        ])
    }

    fn config_entry(index: LogIndex, cfg: &Configuration) -> LogEntry {
        LogEntry::new(index, 1, 0, LogEntryType::Configuration, to_bytes(cfg))
    }

    #[test]
    fn test_bootstrap_view() {
        let view = ClusterView::new(abc());
        assert_eq!(view.index(), 0);
        assert!(view.is_committed(0));
        assert!(view.is_quorum([1, 3].iter()));
        let targets: Vec<NodeId> = view.replication_targets(1).iter().map(|m| m.id).collect();
        assert_eq!(targets, vec![2, 3]);
    }

    #[test]
    fn test_joint_view_requires_both_sets() {
        let mut view = ClusterView::new(abc());
        let next = abc().without_member(3);
        view.update(4, abc().enter_joint(&next));

        assert!(!view.is_committed(3));
        assert_eq!(view.voter_sets().len(), 2);
        assert!(view.is_quorum([1, 2].iter()));
        assert!(!view.is_quorum([1, 3].iter()));
        // departing member still gets the log
        assert!(view.member(3).is_some());
        assert_eq!(view.replication_targets(1).len(), 2);
    }

    #[test]
    fn test_rebuild_after_truncation() {
        let mut log = MemLog::new();
        let with_d = abc().with_member(Member::new(4, "d", MemberRole::Joining));
        log.append(&[
            LogEntry::new(1, 1, 0, LogEntryType::Noop, Vec::new()),
            config_entry(2, &with_d),
            LogEntry::new(3, 1, 0, LogEntryType::Noop, Vec::new()),
        ])
        .unwrap();

        let mut view = ClusterView::new(abc());
        view.rebuild(&log).unwrap();
        assert_eq!(view.index(), 2);
        assert!(view.configuration().contains(4));

        log.truncate_from(2).unwrap();
        view.rebuild(&log).unwrap();
        assert_eq!(view.index(), 0);
        assert_eq!(view.configuration(), &abc());
    }
}
