use accord_common::types::NodeId;
use std::collections::BTreeSet;

/// Number of members that constitute a majority of `n`
pub fn majority_of(n: usize) -> usize {
    n / 2 + 1
}

/// A set of voters that can decide whether some ids form a quorum.
pub trait QuorumSet {
    fn is_quorum<'a, I>(&self, ids: I) -> bool
    where
        I: Iterator<Item = &'a NodeId> + Clone;
}

/// Simple majority of a single voter set
impl QuorumSet for BTreeSet<NodeId> {
    fn is_quorum<'a, I>(&self, ids: I) -> bool
    where
        I: Iterator<Item = &'a NodeId> + Clone,
    {
        let majority = majority_of(self.len());
        let mut count = 0;
        for id in ids {
            if self.contains(id) {
                count += 1;
                if count >= majority {
                    return true;
                }
            }
        }
        false
    }
}

/// Joint quorum: the ids must be a quorum in every child set.
impl<QS: QuorumSet> QuorumSet for Vec<QS> {
    fn is_quorum<'a, I>(&self, ids: I) -> bool
    where
        I: Iterator<Item = &'a NodeId> + Clone,
    {
        self.iter().all(|child| child.is_quorum(ids.clone()))
    }
}
