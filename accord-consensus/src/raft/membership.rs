use super::log::LogStore;
use super::node::{NodeRole, PendingChange, PendingKind, RaftNode, Ticket};
use super::state_machine::StateMachine;
use crate::protocol::{
    ErrorKind, JoinRequest, LeaveRequest, MembershipPayload, MessageType, RaftResponse, Response,
};
use accord_common::error::Result;
use accord_common::types::{CorrelationId, LogEntry, Member, MemberRole, NodeId};
use tracing::{info, warn};

impl<S: LogStore, M: StateMachine> RaftNode<S, M> {
    /// At most one membership change runs at a time
    pub(super) fn change_in_progress(&self) -> bool {
        let configuration = self.cluster.configuration();
        self.pending.is_some()
            || !self.cluster.is_committed(self.commit_index)
            || configuration.is_joint()
            || configuration.joining().is_some()
    }

    fn membership_error(
        &self,
        message_type: MessageType,
        id: CorrelationId,
        kind: ErrorKind,
        message: String,
    ) -> Option<RaftResponse> {
        Some(RaftResponse::error(message_type, id, kind, message))
    }

    /// Admit a new member. The caller is answered once the member has
    /// caught up and its promotion to voter has been appended.
    pub(super) fn handle_join(
        &mut self,
        ticket: Ticket,
        req: JoinRequest,
    ) -> Result<Option<RaftResponse>> {
        if self.role != NodeRole::Leader {
            let message = self.no_leader_message();
            return Ok(self.membership_error(MessageType::Join, req.id, ErrorKind::NoLeader, message));
        }
        if self.change_in_progress() {
            return Ok(self.membership_error(
                MessageType::Join,
                req.id,
                ErrorKind::IllegalMemberState,
                "a membership change is already in progress".to_string(),
            ));
        }
        let member_id = req.member.id;
        if self.cluster.configuration().contains(member_id) {
            return Ok(self.membership_error(
                MessageType::Join,
                req.id,
                ErrorKind::IllegalMemberState,
                format!("node {} is already a member", member_id),
            ));
        }

        info!(node = self.id, member = %req.member, "member joining");
        let member = Member::new(member_id, req.member.address, MemberRole::Joining);
        let next = self.cluster.configuration().with_member(member);
        self.pending = Some(PendingChange {
            kind: PendingKind::Join(member_id),
            request_id: req.id,
            ticket: Some(ticket),
            started: self.ticks,
        });
        if let Err(err) = self.append_configuration(&next) {
            self.pending = None;
            return Err(err);
        }
        Ok(None)
    }

    /// Remove a member. Answered as soon as the first configuration entry
    /// of the removal is appended.
    pub(super) fn handle_leave(&mut self, req: LeaveRequest) -> Result<Option<RaftResponse>> {
        if self.role != NodeRole::Leader {
            let message = self.no_leader_message();
            return Ok(self.membership_error(MessageType::Leave, req.id, ErrorKind::NoLeader, message));
        }
        if self.change_in_progress() {
            return Ok(self.membership_error(
                MessageType::Leave,
                req.id,
                ErrorKind::IllegalMemberState,
                "a membership change is already in progress".to_string(),
            ));
        }
        let current = self.cluster.configuration().clone();
        let Some(member) = current.member(req.member_id).cloned() else {
            return Ok(self.membership_error(
                MessageType::Leave,
                req.id,
                ErrorKind::IllegalMemberState,
                format!("node {} is not a member", req.member_id),
            ));
        };
        let next = current.without_member(member.id);
        if next.voters().is_empty() {
            return Ok(self.membership_error(
                MessageType::Leave,
                req.id,
                ErrorKind::IllegalMemberState,
                format!("node {} is the last voter", member.id),
            ));
        }

        info!(node = self.id, member = %member, "member leaving");
        let target = if member.is_voting() {
            current.enter_joint(&next)
        } else {
            next
        };
        self.pending = Some(PendingChange {
            kind: PendingKind::Leave(member.id),
            request_id: req.id,
            ticket: None,
            started: self.ticks,
        });
        let entry = match self.append_configuration(&target) {
            Ok(entry) => entry,
            Err(err) => {
                self.pending = None;
                return Err(err);
            }
        };
        Ok(Some(RaftResponse::Leave(membership_ok(
            req.id,
            &entry,
            target.members,
        ))))
    }

    /// Take over a join that an earlier leader left with its member still
    /// `Joining`. There is no caller to answer, but the join still times out.
    pub(super) fn adopt_interrupted_join(&mut self) {
        if self.role != NodeRole::Leader || self.pending.is_some() {
            return;
        }
        let Some(member_id) = self.cluster.configuration().joining().map(|m| m.id) else {
            return;
        };
        info!(node = self.id, member = member_id, "resuming interrupted join");
        self.pending = Some(PendingChange {
            kind: PendingKind::Join(member_id),
            request_id: 0,
            ticket: None,
            started: self.ticks,
        });
    }

    /// Drive the active change one step once its latest entry has committed
    pub(super) fn advance_membership(&mut self) -> Result<()> {
        if self.role != NodeRole::Leader || !self.cluster.is_committed(self.commit_index) {
            return Ok(());
        }
        let configuration = self.cluster.configuration().clone();

        if configuration.is_joint() {
            info!(
                node = self.id,
                index = self.cluster.index(),
                "joint configuration committed"
            );
            self.append_configuration(&configuration.leave_joint())?;
            return Ok(());
        }

        if let Some(joining) = configuration.joining().cloned() {
            if !self.caught_up(joining.id) {
                return Ok(());
            }
            info!(node = self.id, member = joining.id, "member caught up, promoting");
            let next = configuration.with_role(joining.id, MemberRole::Voting);
            let joint = configuration.enter_joint(&next);
            // claimed before appending: a lone voter commits the rest inline
            let caller = self
                .pending
                .as_mut()
                .filter(|p| p.kind == PendingKind::Join(joining.id))
                .and_then(|p| p.ticket.take().map(|ticket| (ticket, p.request_id)));
            let entry = self.append_configuration(&joint)?;
            if let Some((ticket, request_id)) = caller {
                let response = membership_ok(request_id, &entry, joint.members);
                self.reply(ticket, RaftResponse::Join(response));
            }
            return Ok(());
        }

        if let Some(change) = self.pending.take() {
            info!(node = self.id, kind = ?change.kind, "membership change complete");
        }
        if !configuration.contains(self.id) {
            info!(node = self.id, "removed from the cluster, stepping down");
            let term = self.current_term;
            self.become_follower(term, None)?;
        }
        Ok(())
    }

    /// Whether a joining member holds the configuration that admitted it
    /// and is close enough to the end of the log
    fn caught_up(&self, id: NodeId) -> bool {
        self.progress.get(&id).map_or(false, |p| {
            p.match_index >= self.cluster.index()
                && p.match_index + self.config.catch_up_lag >= self.log.last_index()
        })
    }

    /// Give up on a member that did not catch up in time
    pub(super) fn check_join_timeout(&mut self) -> Result<()> {
        let Some(change) = self.pending.clone() else {
            return Ok(());
        };
        let PendingKind::Join(member_id) = change.kind else {
            return Ok(());
        };
        if self.ticks.saturating_sub(change.started) < self.config.join_timeout_ticks()
            || !self.cluster.is_committed(self.commit_index)
        {
            return Ok(());
        }
        let configuration = self.cluster.configuration().clone();
        let still_joining = configuration
            .member(member_id)
            .map_or(false, |m| m.role == MemberRole::Joining);
        if !still_joining {
            return Ok(());
        }

        warn!(
            node = self.id,
            member = member_id,
            "member did not catch up in time, removing"
        );
        if let Some(ticket) = change.ticket {
            let response = RaftResponse::error(
                MessageType::Join,
                change.request_id,
                ErrorKind::ConfigurationError,
                format!("node {} did not catch up with the log in time", member_id),
            );
            self.reply(ticket, response);
        }
        self.pending = Some(PendingChange {
            kind: PendingKind::Abort(member_id),
            request_id: change.request_id,
            ticket: None,
            started: self.ticks,
        });
        self.append_configuration(&configuration.without_member(member_id))?;
        Ok(())
    }
}

fn membership_ok(
    id: CorrelationId,
    entry: &LogEntry,
    members: Vec<Member>,
) -> Response<MembershipPayload> {
    Response::ok(
        id,
        MembershipPayload {
            index: entry.index,
            term: entry.term,
            timestamp: entry.timestamp,
            members,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use crate::raft::testing::{cluster_of, join, leave, reply_in, single_node, Network};
    use accord_common::types::Configuration;
    use std::collections::BTreeSet;

    fn error_kind(response: &RaftResponse) -> Option<ErrorKind> {
        match response {
            RaftResponse::Join(r) => r.error().map(|e| e.kind),
            RaftResponse::Leave(r) => r.error().map(|e| e.kind),
            _ => None,
        }
    }

    fn voters(configuration: &Configuration) -> Vec<NodeId> {
        configuration.voters().into_iter().collect()
    }

    #[test]
    fn test_join_promotes_member_to_voter() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.add_node(4);

        let ticket = net.client(1, join(4));
        for _ in 0..3 {
            net.settle();
        }

        let RaftResponse::Join(resp) = net.reply(ticket).unwrap() else {
            panic!("expected a join reply");
        };
        assert_eq!(resp.status(), Status::Ok);
        assert!(resp.members().iter().any(|m| m.id == 4 && m.is_voting()));
        assert!(resp.index() > 0);

        for id in 1..=4 {
            let status = net.node(id).status();
            assert!(!status.configuration.is_joint());
            assert_eq!(voters(&status.configuration), vec![1, 2, 3, 4]);
            assert!(status.configuration_index <= status.commit_index);
        }
        assert!(net.node(1).pending.is_none());
    }

    #[test]
    fn test_join_at_follower_names_leader() {
        let mut net = cluster_of(3);
        net.elect(1);
        let ticket = net.client(2, join(4));
        let reply = net.reply(ticket).unwrap();
        assert_eq!(error_kind(&reply), Some(ErrorKind::NoLeader));
        let RaftResponse::Join(resp) = reply else {
            panic!("expected a join reply");
        };
        assert!(resp.error().unwrap().message.contains("leader is 1 at node-1"));
        assert_eq!(resp.index(), 0);
        assert!(resp.members().is_empty());
    }

    #[test]
    fn test_second_join_rejected_while_pending() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.add_node(4);
        net.isolate(4);

        let first = net.client(1, join(4));
        assert!(net.reply(first).is_none());

        let again = net.client(1, join(4));
        assert_eq!(
            error_kind(&net.reply(again).unwrap()),
            Some(ErrorKind::IllegalMemberState)
        );
        let other = net.client(1, leave(3));
        assert_eq!(
            error_kind(&net.reply(other).unwrap()),
            Some(ErrorKind::IllegalMemberState)
        );
    }

    #[test]
    fn test_join_existing_member_rejected() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.settle();
        let ticket = net.client(1, join(2));
        assert_eq!(
            error_kind(&net.reply(ticket).unwrap()),
            Some(ErrorKind::IllegalMemberState)
        );
    }

    #[test]
    fn test_join_times_out() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.add_node(4);
        net.isolate(4);
        let ticket = net.client(1, join(4));

        let timeout = net.node(1).config().join_timeout_ticks();
        let rounds = timeout / 10 + 2;
        for _ in 0..rounds {
            net.settle();
        }

        assert_eq!(
            error_kind(&net.reply(ticket).unwrap()),
            Some(ErrorKind::ConfigurationError)
        );
        let leader = net.node(1);
        assert!(!leader.configuration().contains(4));
        assert!(leader.pending.is_none());
        assert!(!leader.progress.contains_key(&4));
        assert_eq!(leader.role(), NodeRole::Leader);
    }

    #[test]
    fn test_leave_shrinks_quorum() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.settle();

        let ticket = net.client(1, leave(3));
        let RaftResponse::Leave(resp) = net.reply(ticket).unwrap() else {
            panic!("expected a leave reply");
        };
        assert_eq!(resp.status(), Status::Ok);
        assert!(resp.members().iter().all(|m| m.id != 3));
        net.settle();

        let leader = net.node(1);
        assert!(!leader.configuration().is_joint());
        assert_eq!(voters(leader.configuration()), vec![1, 2]);
        assert!(!leader.progress.contains_key(&3));
        assert!(leader.cluster.is_quorum([1, 2].iter()));
        assert!(!leader.cluster.is_quorum([1].iter()));
        assert!(leader.pending.is_none());

        // the departed node campaigns but cannot disturb the remaining pair
        let term = net.node(1).current_term();
        for _ in 0..10 {
            net.settle();
        }
        assert!(net.node(3).current_term() > term);
        assert_eq!(net.node(1).current_term(), term);
        assert_eq!(net.node(1).role(), NodeRole::Leader);
    }

    #[test]
    fn test_leave_unknown_or_last_voter() {
        let mut net = cluster_of(3);
        net.elect(1);
        let ticket = net.client(1, leave(9));
        assert_eq!(
            error_kind(&net.reply(ticket).unwrap()),
            Some(ErrorKind::IllegalMemberState)
        );

        let mut node = single_node(1);
        node.start_election().unwrap();
        node.take_outputs();
        node.step(5, leave(1));
        let outputs = node.take_outputs();
        assert_eq!(
            error_kind(&reply_in(&outputs, 5)),
            Some(ErrorKind::IllegalMemberState)
        );
    }

    #[test]
    fn test_leader_leaving_steps_down() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.settle();

        net.client(1, leave(1));
        net.settle();
        assert_eq!(net.node(1).role(), NodeRole::Follower);
        assert!(!net.node(1).configuration().contains(1));

        for _ in 0..20 {
            net.settle();
        }
        let leader = net.leader().unwrap();
        assert!(leader == 2 || leader == 3);
        assert_eq!(voters(net.node(leader).configuration()), vec![2, 3]);
    }

    #[test]
    fn test_step_down_answers_pending_join() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.add_node(4);
        net.isolate(4);
        let ticket = net.client(1, join(4));

        let term = net.node(1).current_term();
        net.node_mut(1).become_follower(term + 1, None).unwrap();
        net.run();
        assert_eq!(
            error_kind(&net.reply(ticket).unwrap()),
            Some(ErrorKind::NoLeader)
        );
    }

    #[test]
    fn test_new_leader_finishes_joint_configuration() {
        let mut net = cluster_of(3);
        net.elect(1);
        net.settle();

        // node 2 holds a joint configuration appended by the old leader
        let current = net.node(2).configuration().clone();
        let joint = current.enter_joint(&current.without_member(3));
        let index = net.node(2).log().last_index() + 1;
        let term = net.node(2).current_term();
        let data = crate::protocol::codec::to_bytes(&joint);
        let entry = LogEntry::new(index, term, 0, accord_common::types::LogEntryType::Configuration, data);
        for id in [1, 2, 3] {
            let node = net.node_mut(id);
            node.log.append(std::slice::from_ref(&entry)).unwrap();
            node.cluster.rebuild(&node.log).unwrap();
        }
        net.isolate(3);
        net.elect(2);
        net.settle();

        let leader = net.node(2);
        assert!(!leader.configuration().is_joint());
        let expected: BTreeSet<NodeId> = BTreeSet::from([1, 2]);
        assert_eq!(leader.configuration().voters(), expected);
    }

    /// Node 1 leads and has committed node 4 as `Joining`, then loses
    /// contact with the rest; node 2 takes over
    fn fail_over_during_join(net: &mut Network) {
        net.elect(1);
        net.add_node(4);
        net.isolate(4);
        net.client(1, join(4));
        net.settle();
        assert_eq!(net.node(2).configuration().joining().map(|m| m.id), Some(4));
    }

    #[test]
    fn test_new_leader_promotes_joining_member() {
        let mut net = cluster_of(3);
        fail_over_during_join(&mut net);
        net.heal();
        net.isolate(1);
        net.elect(2);
        assert_eq!(net.node(2).role(), NodeRole::Leader);
        assert!(net.node(2).pending.is_some());

        for _ in 0..5 {
            net.settle();
        }

        let leader = net.node(2);
        let configuration = leader.configuration();
        assert!(!configuration.is_joint());
        assert!(configuration.joining().is_none());
        assert!(configuration.member(4).unwrap().is_voting());
        assert_eq!(voters(configuration), vec![1, 2, 3, 4]);
        assert!(leader.cluster.is_committed(leader.commit_index()));
        assert!(leader.pending.is_none());
        assert!(net.node(4).configuration().member(4).unwrap().is_voting());
    }

    #[test]
    fn test_new_leader_times_out_unreachable_joining_member() {
        let mut net = cluster_of(3);
        fail_over_during_join(&mut net);
        net.isolate(1);
        net.elect(2);
        assert_eq!(net.node(2).role(), NodeRole::Leader);

        let timeout = net.node(2).config().join_timeout_ticks();
        for _ in 0..timeout / 10 + 4 {
            net.settle();
        }

        let leader = net.node(2);
        assert_eq!(leader.role(), NodeRole::Leader);
        assert!(leader.configuration().joining().is_none());
        assert!(!leader.configuration().contains(4));
        assert!(leader.pending.is_none());
        assert!(!leader.change_in_progress());

        // membership changes are accepted again
        net.add_node(5);
        net.isolate(5);
        let ticket = net.client(2, join(5));
        assert!(net.reply(ticket).is_none());
        assert_eq!(
            net.node(2).pending.as_ref().map(|p| p.kind),
            Some(PendingKind::Join(5))
        );
    }
}
