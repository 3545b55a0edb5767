use super::cluster::ClusterView;
use super::log::LogStore;
use super::progress::Progress;
use super::state_machine::StateMachine;
use super::timer::ElectionTimer;
use crate::protocol::{ErrorKind, MessageType, RaftRequest, RaftResponse};
use accord_common::config::{ClusterConfig, RaftConfig};
use accord_common::error::Result;
use accord_common::types::{
    Configuration, CorrelationId, LogIndex, Member, NodeId, Term,
};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info};

/// Caller slot the driver uses to route a reply back
pub type Ticket = u64;

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Work the node hands to its driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Deliver `request` to `to`; the outcome must come back as a `Completion`
    Send {
        to: Member,
        term: Term,
        request: RaftRequest,
    },
    /// Answer the caller that submitted `ticket`
    Reply {
        ticket: Ticket,
        response: RaftResponse,
    },
}

/// Outcome of an RPC issued through `Output::Send`, tagged with the term it
/// was sent in.
#[derive(Debug, Clone)]
pub struct Completion {
    pub to: NodeId,
    pub term: Term,
    pub request: RaftRequest,
    pub result: std::result::Result<RaftResponse, String>,
}

/// Point-in-time view of a node, for callers and tests
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub configuration: Configuration,
    pub configuration_index: LogIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PendingKind {
    Join(NodeId),
    Leave(NodeId),
    /// Removing a member that never caught up
    Abort(NodeId),
}

/// The single membership change a leader is driving
#[derive(Debug, Clone)]
pub(super) struct PendingChange {
    pub kind: PendingKind,
    pub request_id: CorrelationId,
    /// Caller still waiting for an answer
    pub ticket: Option<Ticket>,
    pub started: u64,
}

#[derive(Debug, Clone)]
pub(super) struct PendingCommand {
    pub ticket: Ticket,
    pub request_id: CorrelationId,
}

#[derive(Debug, Clone)]
pub(super) struct PendingQuery {
    pub ticket: Ticket,
    pub request_id: CorrelationId,
    pub query: Bytes,
}

/// A Raft node: controls its own state and participates in consensus.
///
/// The node performs no I/O. Every event enters through `tick`, `step` or
/// `handle_completion`, and the resulting messages are collected with
/// `take_outputs`. Callers must serialize access, which the driver does by
/// owning the node inside a single task.
pub struct RaftNode<S: LogStore, M: StateMachine> {
    pub(super) id: NodeId,
    pub(super) config: RaftConfig,
    pub(super) role: NodeRole,
    pub(super) current_term: Term,
    pub(super) voted_for: Option<NodeId>,
    pub(super) leader_id: Option<NodeId>,
    pub(super) commit_index: LogIndex,
    pub(super) last_applied: LogIndex,
    pub(super) log: S,
    pub(super) state_machine: M,
    pub(super) cluster: ClusterView,
    pub(super) timer: ElectionTimer,
    pub(super) votes: BTreeSet<NodeId>,
    pub(super) progress: BTreeMap<NodeId, Progress>,
    pub(super) pending: Option<PendingChange>,
    pub(super) pending_commands: BTreeMap<LogIndex, PendingCommand>,
    pub(super) pending_queries: Vec<PendingQuery>,
    /// Index of the no-op the leader appended when it took office
    pub(super) term_start_index: LogIndex,
    /// Logical clock, one per `tick`
    pub(super) ticks: u64,
    pub(super) heartbeat_elapsed: u64,
    pub(super) lease_elapsed: u64,
    pub(super) next_request_id: CorrelationId,
    pub(super) outputs: Vec<Output>,
}

impl<S: LogStore, M: StateMachine> RaftNode<S, M> {
    /// Create a node in Follower state.
    ///
    /// Term and vote are reloaded from `log`, and the active configuration
    /// is the newest one found in `log`, else `bootstrap`.
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        bootstrap: Configuration,
        log: S,
        state_machine: M,
    ) -> Result<Self> {
        config.validate()?;
        let (current_term, voted_for) = log.hard_state();
        let mut cluster = ClusterView::new(bootstrap);
        cluster.rebuild(&log)?;
        let (min, max) = config.election_ticks();

        info!(
            node = id,
            term = current_term,
            last_index = log.last_index(),
            "starting raft node"
        );

        Ok(Self {
            id,
            timer: ElectionTimer::new(min, max, StdRng::from_entropy()),
            config,
            role: NodeRole::Follower,
            current_term,
            voted_for,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            log,
            state_machine,
            cluster,
            votes: BTreeSet::new(),
            progress: BTreeMap::new(),
            pending: None,
            pending_commands: BTreeMap::new(),
            pending_queries: Vec::new(),
            term_start_index: 0,
            ticks: 0,
            heartbeat_elapsed: 0,
            lease_elapsed: 0,
            next_request_id: 1,
            outputs: Vec::new(),
        })
    }

    /// Create a node from its static configuration file
    pub fn from_config(config: &ClusterConfig, log: S, state_machine: M) -> Result<Self> {
        config.validate()?;
        Self::new(
            config.node_id,
            config.raft.clone(),
            config.bootstrap(),
            log,
            state_machine,
        )
    }

    /// Pin the election timer's random sequence
    pub fn with_seed(mut self, seed: u64) -> Self {
        let (min, max) = self.config.election_ticks();
        self.timer = ElectionTimer::from_seed(min, max, seed);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn log(&self) -> &S {
        &self.log
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    pub fn configuration(&self) -> &Configuration {
        self.cluster.configuration()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role,
            term: self.current_term,
            leader: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            configuration: self.cluster.configuration().clone(),
            configuration_index: self.cluster.index(),
        }
    }

    /// Drain everything queued for the driver
    pub fn take_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }

    /// Called periodically: heartbeats and lease checks as leader,
    /// election timeout otherwise
    pub fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        match self.role {
            NodeRole::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_ticks() {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append();
                }

                self.lease_elapsed += 1;
                if self.lease_elapsed >= self.timer.min() {
                    self.lease_elapsed = 0;
                    if !self.has_quorum_contact() {
                        info!(
                            node = self.id,
                            term = self.current_term,
                            "lost contact with a quorum, stepping down"
                        );
                        let term = self.current_term;
                        return self.become_follower(term, None);
                    }
                }
                self.check_join_timeout()
            }
            NodeRole::Follower | NodeRole::Candidate => {
                if !self.timer.tick() {
                    return Ok(());
                }
                if self.cluster.is_voter(self.id) {
                    self.start_election()
                } else {
                    // non-voting members wait for the leader to find them
                    self.timer.reset();
                    Ok(())
                }
            }
        }
    }

    /// Handle one inbound request; the answer is queued as `Output::Reply`
    /// for `ticket`, immediately or once it is known.
    pub fn step(&mut self, ticket: Ticket, request: RaftRequest) {
        let id = request.id();
        let message_type = request.message_type();
        let result = match request {
            RaftRequest::Vote(req) => self.handle_vote_request(req).map(|r| Some(RaftResponse::Vote(r))),
            RaftRequest::Append(req) => self
                .handle_append_request(req)
                .map(|r| Some(RaftResponse::Append(r))),
            RaftRequest::Join(req) => self.handle_join(ticket, req),
            RaftRequest::Leave(req) => self.handle_leave(req),
            RaftRequest::Command(req) => self.handle_command(ticket, req),
            RaftRequest::Query(req) => self.handle_query(ticket, req),
        };
        match result {
            Ok(Some(response)) => self.reply(ticket, response),
            Ok(None) => {}
            Err(err) => {
                error!(node = self.id, ?message_type, error = %err, "request failed");
                let response =
                    RaftResponse::error(message_type, id, ErrorKind::InternalError, err.to_string());
                self.reply(ticket, response);
            }
        }
    }

    /// Fold the outcome of an outbound RPC back into the node
    pub fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            to,
            term,
            request,
            result,
        } = completion;
        match (request, result) {
            (RaftRequest::Append(req), Ok(RaftResponse::Append(resp))) => {
                self.handle_append_response(to, term, req, resp)
            }
            (RaftRequest::Vote(_), Ok(RaftResponse::Vote(resp))) => {
                self.handle_vote_response(to, term, resp)
            }
            (RaftRequest::Append(_), Err(reason)) => self.handle_append_failure(to, term, &reason),
            (RaftRequest::Vote(_), Err(reason)) => {
                tracing::debug!(node = self.id, peer = to, %reason, "vote request failed");
                Ok(())
            }
            (request, Ok(response)) => {
                tracing::warn!(
                    node = self.id,
                    peer = to,
                    sent = ?request.message_type(),
                    received = ?response.message_type(),
                    "mismatched response"
                );
                match request {
                    RaftRequest::Append(_) => {
                        self.handle_append_failure(to, term, "mismatched response")
                    }
                    _ => Ok(()),
                }
            }
            (_, Err(_)) => Ok(()),
        }
    }

    pub(super) fn reply(&mut self, ticket: Ticket, response: RaftResponse) {
        self.outputs.push(Output::Reply { ticket, response });
    }

    pub(super) fn send(&mut self, to: Member, request: RaftRequest) {
        self.outputs.push(Output::Send {
            to,
            term: self.current_term,
            request,
        });
    }

    pub(super) fn next_request_id(&mut self) -> CorrelationId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Message for callers that reached a node other than the leader
    pub(super) fn no_leader_message(&self) -> String {
        match self.leader_id.and_then(|id| self.cluster.member(id)) {
            Some(leader) => format!(
                "node {} is not the leader; leader is {} at {}",
                self.id, leader.id, leader.address
            ),
            None => format!("node {} is not the leader; no leader is known", self.id),
        }
    }

    /// Whether the leader heard from a quorum within the last election timeout
    fn has_quorum_contact(&self) -> bool {
        let window = self.timer.min();
        let mut ids = vec![self.id];
        ids.extend(
            self.progress
                .iter()
                .filter(|(_, p)| self.ticks.saturating_sub(p.last_ack) <= window)
                .map(|(id, _)| *id),
        );
        self.cluster.is_quorum(ids.iter())
    }

    /// Transition to follower role, adopting `term` if it is newer
    pub(super) fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        let was_leader = self.role == NodeRole::Leader;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.log.save_hard_state(term, None)?;
        }
        if self.role != NodeRole::Follower {
            info!(node = self.id, term = self.current_term, "became follower");
        }
        self.role = NodeRole::Follower;
        self.leader_id = leader;
        self.votes.clear();
        self.progress.clear();
        self.timer.reset();
        if was_leader {
            self.fail_pending();
        }
        Ok(())
    }

    /// Transition to leader role and assert it with a no-op entry
    pub(super) fn become_leader(&mut self) -> Result<()> {
        info!(node = self.id, term = self.current_term, "became leader");
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.heartbeat_elapsed = 0;
        self.lease_elapsed = 0;
        self.progress.clear();
        self.sync_progress();
        self.adopt_interrupted_join();
        let entry = self.append_entry(accord_common::types::LogEntryType::Noop, Bytes::new())?;
        self.term_start_index = entry.index;
        Ok(())
    }

    /// Track exactly the members that must receive the log
    pub(super) fn sync_progress(&mut self) {
        if self.role != NodeRole::Leader {
            return;
        }
        let targets = self.cluster.replication_targets(self.id);
        let next = self.log.last_index() + 1;
        let now = self.ticks;
        self.progress
            .retain(|id, _| targets.iter().any(|m| m.id == *id));
        for member in targets {
            self.progress
                .entry(member.id)
                .or_insert_with(|| Progress::new(next, now));
        }
    }

    /// Give every waiting caller a terminal answer after losing leadership
    pub(super) fn fail_pending(&mut self) {
        for (index, pending) in std::mem::take(&mut self.pending_commands) {
            let response = RaftResponse::error(
                MessageType::Command,
                pending.request_id,
                ErrorKind::CommandFailure,
                format!("leadership lost before index {} was committed", index),
            );
            self.reply(pending.ticket, response);
        }
        for pending in std::mem::take(&mut self.pending_queries) {
            let response = RaftResponse::error(
                MessageType::Query,
                pending.request_id,
                ErrorKind::QueryFailure,
                "leadership lost before the query could be served",
            );
            self.reply(pending.ticket, response);
        }
        if let Some(change) = self.pending.take() {
            if let Some(ticket) = change.ticket {
                let message_type = match change.kind {
                    PendingKind::Leave(_) => MessageType::Leave,
                    PendingKind::Join(_) | PendingKind::Abort(_) => MessageType::Join,
                };
                let response = RaftResponse::error(
                    message_type,
                    change.request_id,
                    ErrorKind::NoLeader,
                    "leader stepped down before the configuration change completed",
                );
                self.reply(ticket, response);
            }
        }
    }
}

pub(super) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
