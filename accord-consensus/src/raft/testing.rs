//! Synchronous in-memory cluster for exercising `RaftNode` without a runtime.

use super::log::MemLog;
use super::node::{Completion, NodeRole, Output, RaftNode, Ticket};
use super::state_machine::{KeyValueStore, KvCommand, KvQuery};
use crate::protocol::{
    CommandRequest, JoinRequest, LeaveRequest, QueryRequest, RaftRequest, RaftResponse,
    VoteRequest,
};
use accord_common::config::RaftConfig;
use accord_common::types::{
    Configuration, LogEntry, LogEntryType, LogIndex, Member, MemberRole, NodeId, Term,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

pub type TestNode = RaftNode<MemLog, KeyValueStore>;

pub fn address(id: NodeId) -> String {
    format!("node-{}", id)
}

/// Election timeouts of 30..=60 ticks, heartbeats every 5, joins give up
/// after 200
pub fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_ms: (300, 600),
        join_timeout_ms: 2000,
        ..RaftConfig::default()
    }
}

pub fn node_with(id: NodeId, bootstrap: Configuration) -> TestNode {
    RaftNode::new(id, test_config(), bootstrap, MemLog::new(), KeyValueStore::default())
        .unwrap()
        .with_seed(id)
}

pub fn single_node(id: NodeId) -> TestNode {
    node_with(id, Configuration::new(vec![Member::voting(id, address(id))]))
}

pub fn cluster_of(n: u64) -> Network {
    let bootstrap = Configuration::new((1..=n).map(|id| Member::voting(id, address(id))).collect());
    Network::new((1..=n).map(|id| node_with(id, bootstrap.clone())).collect())
}

pub fn entry(index: LogIndex, term: Term) -> LogEntry {
    LogEntry::new(index, term, 0, LogEntryType::Noop, Vec::new())
}

pub fn vote_request(
    candidate: NodeId,
    term: Term,
    last_log_index: LogIndex,
    last_log_term: Term,
) -> VoteRequest {
    VoteRequest {
        id: 1,
        term,
        candidate,
        last_log_index,
        last_log_term,
    }
}

pub fn command(command: KvCommand) -> RaftRequest {
    RaftRequest::Command(CommandRequest {
        id: 1,
        command: command.to_bytes().unwrap(),
    })
}

pub fn query(query: KvQuery) -> RaftRequest {
    RaftRequest::Query(QueryRequest {
        id: 1,
        query: query.to_bytes().unwrap(),
    })
}

pub fn join(id: NodeId) -> RaftRequest {
    RaftRequest::Join(JoinRequest {
        id: 1,
        member: Member::new(id, address(id), MemberRole::Voting),
    })
}

pub fn leave(id: NodeId) -> RaftRequest {
    RaftRequest::Leave(LeaveRequest { id: 1, member_id: id })
}

/// The reply queued for `ticket`
pub fn reply_in(outputs: &[Output], ticket: Ticket) -> RaftResponse {
    outputs
        .iter()
        .find_map(|output| match output {
            Output::Reply { ticket: t, response } if *t == ticket => Some(response.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no reply for ticket {}", ticket))
}

/// Routes every output to its destination until the cluster goes quiet.
///
/// Messages to or from an isolated node fail immediately, the same way a
/// refused connection would.
pub struct Network {
    nodes: BTreeMap<NodeId, TestNode>,
    isolated: BTreeSet<NodeId>,
    rpcs: HashMap<(NodeId, Ticket), (NodeId, Term, RaftRequest)>,
    replies: HashMap<Ticket, RaftResponse>,
    next_ticket: Ticket,
}

impl Network {
    pub fn new(nodes: Vec<TestNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id(), n)).collect(),
            isolated: BTreeSet::new(),
            rpcs: HashMap::new(),
            replies: HashMap::new(),
            next_ticket: 1,
        }
    }

    /// A fresh node that knows nothing about the cluster yet
    pub fn add_node(&mut self, id: NodeId) {
        self.nodes.insert(id, node_with(id, Configuration::default()));
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TestNode {
        self.nodes.get_mut(&id).unwrap()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.role() == NodeRole::Leader)
            .max_by_key(|n| n.current_term())
            .map(|n| n.id())
    }

    pub fn isolate(&mut self, id: NodeId) {
        self.isolated.insert(id);
    }

    pub fn heal(&mut self) {
        self.isolated.clear();
    }

    /// Make `id` campaign right away
    pub fn elect(&mut self, id: NodeId) {
        self.node_mut(id).start_election().unwrap();
        self.run();
    }

    /// Submit a client request to `id`; returns the ticket to look the
    /// answer up with
    pub fn client(&mut self, id: NodeId, request: RaftRequest) -> Ticket {
        let ticket = self.next_ticket();
        self.node_mut(id).step(ticket, request);
        self.run();
        ticket
    }

    pub fn reply(&self, ticket: Ticket) -> Option<RaftResponse> {
        self.replies.get(&ticket).cloned()
    }

    pub fn tick_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.tick().unwrap();
        }
        self.run();
    }

    /// Two heartbeat intervals
    pub fn settle(&mut self) {
        for _ in 0..10 {
            self.tick_all();
        }
    }

    /// Deliver queued messages until no node has anything left to send
    pub fn run(&mut self) {
        let mut queue = VecDeque::new();
        for _ in 0..10_000 {
            for (id, node) in self.nodes.iter_mut() {
                queue.extend(node.take_outputs().into_iter().map(|o| (*id, o)));
            }
            if queue.is_empty() {
                return;
            }
            while let Some((from, output)) = queue.pop_front() {
                self.route(from, output);
            }
        }
        panic!("network did not quiesce");
    }

    fn next_ticket(&mut self) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn route(&mut self, from: NodeId, output: Output) {
        match output {
            Output::Send { to, term, request } => {
                let reachable = !self.isolated.contains(&from)
                    && !self.isolated.contains(&to.id)
                    && self.nodes.contains_key(&to.id);
                if !reachable {
                    let completion = Completion {
                        to: to.id,
                        term,
                        request,
                        result: Err(format!("{} unreachable", to)),
                    };
                    self.node_mut(from).handle_completion(completion).unwrap();
                    return;
                }
                let ticket = self.next_ticket();
                self.rpcs.insert((to.id, ticket), (from, term, request.clone()));
                self.node_mut(to.id).step(ticket, request);
            }
            Output::Reply { ticket, response } => match self.rpcs.remove(&(from, ticket)) {
                Some((origin, term, request)) => {
                    let completion = Completion {
                        to: from,
                        term,
                        request,
                        result: Ok(response),
                    };
                    self.node_mut(origin).handle_completion(completion).unwrap();
                }
                None => {
                    self.replies.insert(ticket, response);
                }
            },
        }
    }
}
