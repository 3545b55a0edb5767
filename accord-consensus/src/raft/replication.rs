use super::log::LogStore;
use super::node::{now_millis, NodeRole, PendingCommand, PendingQuery, RaftNode, Ticket};
use super::state_machine::StateMachine;
use crate::protocol::codec::{from_bytes, to_bytes};
use crate::protocol::{
    AppendPayload, AppendRequest, AppendResponse, CommandPayload, CommandRequest, ErrorKind,
    MessageType, QueryPayload, QueryRequest, QueryResponse, RaftRequest, RaftResponse, Response,
};
use accord_common::error::{AccordError, Result};
use accord_common::types::{
    Configuration, CorrelationId, LogEntry, LogEntryType, LogIndex, NodeId, Term,
};
use bytes::Bytes;
use tracing::{debug, warn};

impl<S: LogStore, M: StateMachine> RaftNode<S, M> {
    /// Append a new entry to the leader's log and start replicating it
    pub(super) fn append_entry(&mut self, entry_type: LogEntryType, data: Bytes) -> Result<LogEntry> {
        let entry = LogEntry::new(
            self.log.last_index() + 1,
            self.current_term,
            now_millis(),
            entry_type,
            data,
        );
        self.log.append(std::slice::from_ref(&entry))?;
        debug!(
            node = self.id,
            term = entry.term,
            index = entry.index,
            ?entry_type,
            "appended entry"
        );

        if entry_type == LogEntryType::Configuration {
            let configuration: Configuration = from_bytes(entry.data.clone())?;
            self.cluster.update(entry.index, configuration);
            self.sync_progress();
        }

        self.broadcast_append();
        self.update_commit_index()?;
        Ok(entry)
    }

    pub(super) fn append_configuration(&mut self, configuration: &Configuration) -> Result<LogEntry> {
        self.append_entry(LogEntryType::Configuration, to_bytes(configuration))
    }

    /// Send every replication target what it is missing, or a heartbeat
    pub(super) fn broadcast_append(&mut self) {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    pub(super) fn send_append(&mut self, peer: NodeId) {
        if self.role != NodeRole::Leader {
            return;
        }
        let now = self.ticks;
        let last_index = self.log.last_index();
        let next_index = match self.progress.get_mut(&peer) {
            Some(progress) if progress.can_send(now) => {
                progress.next_index = progress.next_index.clamp(1, last_index + 1);
                progress.next_index
            }
            _ => return,
        };
        let Some(member) = self.cluster.member(peer).cloned() else {
            return;
        };
        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            return;
        };

        let request = AppendRequest {
            id: self.next_request_id(),
            term: self.current_term,
            leader: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries(next_index, self.config.max_entries_per_append),
            commit_index: self.commit_index,
        };
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.in_flight = true;
        }
        self.send(member, RaftRequest::Append(request));
    }

    /// Follower side of AppendEntries
    pub(super) fn handle_append_request(&mut self, req: AppendRequest) -> Result<AppendResponse> {
        if req.term < self.current_term {
            return Ok(self.append_payload(req.id, false, self.log.last_index()));
        }
        if req.term > self.current_term || self.role != NodeRole::Follower {
            self.become_follower(req.term, Some(req.leader))?;
        }
        self.leader_id = Some(req.leader);
        self.timer.reset();

        let last_index = self.log.last_index();
        if req.prev_log_index > last_index {
            debug!(
                node = self.id,
                prev = req.prev_log_index,
                last_index,
                "append rejected, log too short"
            );
            return Ok(self.append_payload(req.id, false, last_index));
        }
        if self.log.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            debug!(
                node = self.id,
                prev = req.prev_log_index,
                "append rejected, term mismatch"
            );
            return Ok(self.append_payload(req.id, false, req.prev_log_index.saturating_sub(1)));
        }

        for (offset, entry) in req.entries.iter().enumerate() {
            if entry.index != req.prev_log_index + 1 + offset as u64 {
                return Err(AccordError::Protocol(format!(
                    "non-contiguous entry {} after {}",
                    entry.index, req.prev_log_index
                )));
            }
        }
        let last_new = req.last_index();

        let mut fresh = Vec::new();
        let mut truncated = false;
        for entry in req.entries {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term && fresh.is_empty() => continue,
                Some(_) if fresh.is_empty() => {
                    if entry.index <= self.commit_index {
                        return Err(AccordError::Protocol(format!(
                            "conflicting entry at committed index {}",
                            entry.index
                        )));
                    }
                    warn!(
                        node = self.id,
                        index = entry.index,
                        "truncating conflicting suffix"
                    );
                    self.log.truncate_from(entry.index)?;
                    truncated = true;
                    fresh.push(entry);
                }
                _ => fresh.push(entry),
            }
        }
        if truncated {
            self.cluster.rebuild(&self.log)?;
        }
        if !fresh.is_empty() {
            self.log.append(&fresh)?;
            for entry in fresh
                .iter()
                .filter(|e| e.entry_type == LogEntryType::Configuration)
            {
                let configuration: Configuration = from_bytes(entry.data.clone())?;
                self.cluster.update(entry.index, configuration);
            }
        }

        if req.commit_index > self.commit_index {
            self.commit_index = req.commit_index.min(last_new).max(self.commit_index);
            self.apply_committed()?;
        }
        Ok(self.append_payload(req.id, true, last_new))
    }

    fn append_payload(&self, id: CorrelationId, succeeded: bool, log_index: LogIndex) -> AppendResponse {
        Response::ok(
            id,
            AppendPayload {
                term: self.current_term,
                succeeded,
                log_index,
            },
        )
    }

    /// Leader side: fold a follower's answer into its progress
    pub(super) fn handle_append_response(
        &mut self,
        from: NodeId,
        sent_term: Term,
        req: AppendRequest,
        resp: AppendResponse,
    ) -> Result<()> {
        let payload = match resp.into_result() {
            Ok(payload) => payload,
            Err(err) => return self.handle_append_failure(from, sent_term, &err.to_string()),
        };
        if payload.term > self.current_term {
            return self.become_follower(payload.term, None);
        }
        if self.role != NodeRole::Leader || sent_term != self.current_term {
            return Ok(());
        }

        let now = self.ticks;
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        progress.acknowledge(now);
        if payload.succeeded {
            progress.advance(req.last_index());
            self.update_commit_index()?;
        } else {
            progress.back_off(payload.log_index);
            debug!(
                node = self.id,
                peer = from,
                next_index = progress.next_index,
                "follower rejected append, backing up"
            );
        }

        let behind = self
            .progress
            .get(&from)
            .map_or(false, |p| p.next_index <= self.log.last_index());
        if behind || !payload.succeeded {
            self.send_append(from);
        }
        Ok(())
    }

    /// A lost or failed Append: keep the follower, retry after a backoff
    pub(super) fn handle_append_failure(
        &mut self,
        to: NodeId,
        sent_term: Term,
        reason: &str,
    ) -> Result<()> {
        if self.role != NodeRole::Leader || sent_term != self.current_term {
            return Ok(());
        }
        let now = self.ticks;
        let base = self.config.heartbeat_ticks();
        let cap = self.config.max_backoff_ticks();
        if let Some(progress) = self.progress.get_mut(&to) {
            let backoff = progress.fail(now, base, cap);
            debug!(
                node = self.id,
                peer = to,
                failures = progress.failures,
                backoff,
                %reason,
                "append failed"
            );
        }
        Ok(())
    }

    /// Advance the commit index to the highest current-term entry held by
    /// a quorum, then apply what became committed.
    pub(super) fn update_commit_index(&mut self) -> Result<()> {
        if self.role != NodeRole::Leader {
            return Ok(());
        }
        let mut n = self.log.last_index();
        while n > self.commit_index {
            if self.log.term_at(n) != Some(self.current_term) {
                break;
            }
            let mut ids = vec![self.id];
            ids.extend(
                self.progress
                    .iter()
                    .filter(|(_, p)| p.match_index >= n)
                    .map(|(id, _)| *id),
            );
            if self.cluster.is_quorum(ids.iter()) {
                debug!(node = self.id, commit_index = n, "commit index advanced");
                self.commit_index = n;
                break;
            }
            n -= 1;
        }
        self.apply_committed()?;
        self.advance_membership()
    }

    /// Apply committed entries in index order, answering pending commands
    pub(super) fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.entry(index).ok_or_else(|| {
                AccordError::Storage(format!("committed entry {} is missing", index))
            })?;
            self.last_applied = index;
            if entry.entry_type != LogEntryType::Command {
                continue;
            }

            let result = self.state_machine.apply(index, &entry.data);
            if let Some(pending) = self.pending_commands.remove(&index) {
                let response = match result {
                    Ok(result) => Response::ok(pending.request_id, CommandPayload { index, result }),
                    Err(err) => {
                        Response::err(pending.request_id, ErrorKind::ApplicationError, err.to_string())
                    }
                };
                self.reply(pending.ticket, RaftResponse::Command(response));
            }
        }
        self.serve_queries();
        Ok(())
    }

    pub(super) fn handle_command(
        &mut self,
        ticket: Ticket,
        req: CommandRequest,
    ) -> Result<Option<RaftResponse>> {
        if self.role != NodeRole::Leader {
            return Ok(Some(RaftResponse::error(
                MessageType::Command,
                req.id,
                ErrorKind::NoLeader,
                self.no_leader_message(),
            )));
        }

        // registered first: a single-voter leader commits during append
        let index = self.log.last_index() + 1;
        self.pending_commands.insert(
            index,
            PendingCommand {
                ticket,
                request_id: req.id,
            },
        );
        if let Err(err) = self.append_entry(LogEntryType::Command, req.command) {
            self.pending_commands.remove(&index);
            return Err(err);
        }
        Ok(None)
    }

    pub(super) fn handle_query(
        &mut self,
        ticket: Ticket,
        req: QueryRequest,
    ) -> Result<Option<RaftResponse>> {
        if self.role != NodeRole::Leader {
            return Ok(Some(RaftResponse::error(
                MessageType::Query,
                req.id,
                ErrorKind::NoLeader,
                self.no_leader_message(),
            )));
        }
        if self.commit_index >= self.term_start_index {
            return Ok(Some(RaftResponse::Query(self.answer_query(req.id, &req.query))));
        }
        self.pending_queries.push(PendingQuery {
            ticket,
            request_id: req.id,
            query: req.query,
        });
        Ok(None)
    }

    fn serve_queries(&mut self) {
        if self.role != NodeRole::Leader || self.commit_index < self.term_start_index {
            return;
        }
        for pending in std::mem::take(&mut self.pending_queries) {
            let response = self.answer_query(pending.request_id, &pending.query);
            self.reply(pending.ticket, RaftResponse::Query(response));
        }
    }

    fn answer_query(&self, id: CorrelationId, query: &[u8]) -> QueryResponse {
        match self.state_machine.query(query) {
            Ok(result) => Response::ok(
                id,
                QueryPayload {
                    index: self.last_applied,
                    result,
                },
            ),
            Err(err) => Response::err(id, ErrorKind::ApplicationError, err.to_string()),
        }
    }
}
