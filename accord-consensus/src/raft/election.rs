use super::log::LogStore;
use super::node::{NodeRole, RaftNode};
use super::state_machine::StateMachine;
use crate::protocol::{
    ErrorKind, RaftRequest, Response, VotePayload, VoteRequest, VoteResponse,
};
use accord_common::error::Result;
use accord_common::types::{CorrelationId, NodeId, Term};
use tracing::{debug, info};

impl<S: LogStore, M: StateMachine> RaftNode<S, M> {
    /// Become a candidate for the next term and ask every voter for its vote
    pub fn start_election(&mut self) -> Result<()> {
        self.current_term += 1;
        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.voted_for = Some(self.id);
        self.log.save_hard_state(self.current_term, self.voted_for)?;
        self.votes.clear();
        self.votes.insert(self.id);
        self.timer.reset();

        info!(node = self.id, term = self.current_term, "starting election");

        if self.cluster.is_quorum(self.votes.iter()) {
            return self.become_leader();
        }

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        let peers: Vec<_> = self
            .cluster
            .replication_targets(self.id)
            .into_iter()
            .filter(|m| self.cluster.is_voter(m.id))
            .collect();
        for peer in peers {
            let request = VoteRequest {
                id: self.next_request_id(),
                term: self.current_term,
                candidate: self.id,
                last_log_index,
                last_log_term,
            };
            self.send(peer, RaftRequest::Vote(request));
        }
        Ok(())
    }

    /// Whether a leader of the current term is known to be alive: this node
    /// leads, or heard from the leader within the minimum election timeout
    fn leader_is_live(&self) -> bool {
        self.role == NodeRole::Leader
            || (self.leader_id.is_some() && self.timer.elapsed() < self.timer.min())
    }

    /// Decide whether to grant a vote to a candidate
    pub(super) fn handle_vote_request(&mut self, req: VoteRequest) -> Result<VoteResponse> {
        // a removed member cannot unseat a live leader; once the leader goes
        // quiet, a candidate this node does not know as a voter yet is heard
        if !self.cluster.is_voter(req.candidate) && self.leader_is_live() {
            debug!(
                node = self.id,
                candidate = req.candidate,
                "rejecting vote request from non-voter while the leader is live"
            );
            return Ok(Response::err(
                req.id,
                ErrorKind::IllegalMemberState,
                format!("node {} is not a voting member", req.candidate),
            ));
        }

        if req.term < self.current_term {
            return Ok(self.vote_payload(req.id, false));
        }
        if req.term > self.current_term {
            self.become_follower(req.term, None)?;
        }

        let can_vote = self.voted_for.map_or(true, |v| v == req.candidate);
        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let granted = can_vote && up_to_date;

        if granted {
            self.voted_for = Some(req.candidate);
            self.log.save_hard_state(self.current_term, self.voted_for)?;
            self.timer.reset();
        }

        debug!(
            node = self.id,
            candidate = req.candidate,
            term = self.current_term,
            granted,
            "vote request"
        );
        Ok(self.vote_payload(req.id, granted))
    }

    fn vote_payload(&self, id: CorrelationId, voted: bool) -> VoteResponse {
        Response::ok(
            id,
            VotePayload {
                term: self.current_term,
                voted,
            },
        )
    }

    /// Count a vote returned for the election started in `sent_term`
    pub(super) fn handle_vote_response(
        &mut self,
        from: NodeId,
        sent_term: Term,
        resp: VoteResponse,
    ) -> Result<()> {
        let payload = match resp.into_result() {
            Ok(payload) => payload,
            Err(err) => {
                debug!(node = self.id, peer = from, error = %err, "vote refused");
                return Ok(());
            }
        };

        if payload.term > self.current_term {
            return self.become_follower(payload.term, None);
        }
        if self.role != NodeRole::Candidate || sent_term != self.current_term {
            return Ok(());
        }

        if payload.voted {
            self.votes.insert(from);
            if self.cluster.is_quorum(self.votes.iter()) {
                return self.become_leader();
            }
        }
        Ok(())
    }
}
