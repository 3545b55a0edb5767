use accord_common::types::LogIndex;

/// Leader-side replication state for one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Next entry to send
    pub next_index: LogIndex,
    /// Last index known replicated
    pub match_index: LogIndex,
    /// An append is outstanding, wait for its completion
    pub in_flight: bool,
    /// Consecutive failed RPCs
    pub failures: u32,
    /// Tick before which no new append is sent
    pub retry_at: u64,
    /// Tick of the last response from this follower
    pub last_ack: u64,
}

impl Progress {
    pub fn new(next_index: LogIndex, now: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            in_flight: false,
            failures: 0,
            retry_at: 0,
            last_ack: now,
        }
    }

    pub fn can_send(&self, now: u64) -> bool {
        !self.in_flight && now >= self.retry_at
    }

    /// Record a response, clearing any backoff
    pub fn acknowledge(&mut self, now: u64) {
        self.in_flight = false;
        self.failures = 0;
        self.retry_at = 0;
        self.last_ack = now;
    }

    /// Record a lost RPC and schedule the retry with exponential backoff
    pub fn fail(&mut self, now: u64, base: u64, cap: u64) -> u64 {
        self.in_flight = false;
        self.failures = self.failures.saturating_add(1);
        let shift = self.failures.min(16);
        let backoff = base.saturating_mul(1 << shift).min(cap).max(1);
        self.retry_at = now + backoff;
        backoff
    }

    /// Record a successful append ending at `index`
    pub fn advance(&mut self, index: LogIndex) {
        self.match_index = self.match_index.max(index);
        self.next_index = self.match_index + 1;
    }

    /// Step back after a consistency rejection using the follower's hint
    pub fn back_off(&mut self, hint: LogIndex) {
        let next = self.next_index.saturating_sub(1).min(hint + 1);
        self.next_index = next.max(self.match_index + 1).max(1);
    }
}
