use accord_common::error::{AccordError, Result};
use accord_common::types::{LogEntry, LogIndex, NodeId, Term};

/// Durable home of the replicated log and the node's hard state.
///
/// Indexes start at 1 and are gap free; index 0 is the empty prefix with
/// term 0. Implementations must make `append` and `save_hard_state`
/// durable before returning.
pub trait LogStore: Send + 'static {
    /// Append entries that directly follow the current last entry
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    fn entry(&self, index: LogIndex) -> Option<LogEntry>;

    /// Entries in `[from, from + max)`, possibly fewer
    fn entries(&self, from: LogIndex, max: u64) -> Vec<LogEntry>;

    /// Remove `index` and everything after it
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    fn last_index(&self) -> LogIndex;

    fn last_term(&self) -> Term;

    /// Term of the entry at `index`; `Some(0)` for index 0
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    fn hard_state(&self) -> (Term, Option<NodeId>);
}

/// A complete in-memory log for one Raft node
#[derive(Debug, Default)]
pub struct MemLog {
    entries: Vec<LogEntry>, // entries[i] holds index i + 1
    term: Term,
    voted_for: Option<NodeId>,
}

impl MemLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LogStore for MemLog {
    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(AccordError::Storage(format!(
                    "append at index {} but next index is {}",
                    entry.index, expected
                )));
            }
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1).cloned()
    }

    fn entries(&self, from: LogIndex, max: u64) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        self.entries
            .iter()
            .skip(start)
            .take(max as usize)
            .cloned()
            .collect()
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index == 0 {
            return Err(AccordError::Storage("cannot truncate index 0".into()));
        }
        self.entries.truncate(index as usize - 1);
        Ok(())
    }

    /// Returns the last log index, or 0 if the log is empty
    fn last_index(&self) -> LogIndex {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Returns the term of the last entry, or 0 if empty
    fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn hard_state(&self) -> (Term, Option<NodeId>) {
        (self.term, self.voted_for)
    }
}
