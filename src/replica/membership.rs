use crate::actor::Event;
use crate::replica::log_entry::Payload;
use crate::replica::messages::RaftMessage;
use crate::replica::peers::{MemberId, ServerConfigurationPayload, VotingState};
use crate::replica::replica::{Replica, TransferFollowUp};
use crate::replica::timers::{ScheduledTimeout, TimeoutKind};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// A request to change cluster membership. Any member accepts one; only the leader runs it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerChangeRequest {
    AddServer {
        id: MemberId,
        address: Option<String>,
        voting: bool,
    },
    RemoveServer {
        id: MemberId,
    },
    /// Flips voting state of the listed members. `servers_visited` is bookkeeping for the
    /// request being passed between non-voting members when no leader can be elected.
    ChangeServersVotingStatus {
        voting: BTreeMap<MemberId, bool>,
        servers_visited: Vec<MemberId>,
    },
}

impl ServerChangeRequest {
    fn name(&self) -> &'static str {
        match self {
            ServerChangeRequest::AddServer { .. } => "AddServer",
            ServerChangeRequest::RemoveServer { .. } => "RemoveServer",
            ServerChangeRequest::ChangeServersVotingStatus { .. } => "ChangeServersVotingStatus",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerChangeStatus {
    Ok,
    NoLeader,
    AlreadyExists,
    DoesNotExist,
    NotSupported,
    /// The new server didn't finish installing a snapshot in time.
    Timeout,
    /// An earlier change hasn't reached consensus and timed out. Nothing else runs until it does.
    PriorRequestConsensusTimeout,
    InvalidRequest,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerChangeReply {
    pub status: ServerChangeStatus,
    pub leader_hint: Option<MemberId>,
}

struct ServerOperation {
    operation_id: u64,
    request: ServerChangeRequest,
    reply: Option<oneshot::Sender<ServerChangeReply>>,
    try_to_elect_leader: bool,
}

impl ServerOperation {
    fn new_server_id(&self) -> Option<&MemberId> {
        match &self.request {
            ServerChangeRequest::AddServer { id, .. } => Some(id),
            _ => None,
        }
    }
}

enum OperationState {
    Idle,
    Persisting {
        operation: ServerOperation,
        config_index: i64,
        timed_out: bool,
        _timeout: ScheduledTimeout,
    },
    InstallingSnapshot {
        operation: ServerOperation,
        _timeout: ScheduledTimeout,
    },
    WaitingForPriorSnapshotComplete {
        operation: ServerOperation,
        _timeout: ScheduledTimeout,
    },
    WaitingForLeaderElected {
        operation: ServerOperation,
        previous_config: ServerConfigurationPayload,
        _timeout: ScheduledTimeout,
    },
}

impl OperationState {
    fn name(&self) -> &'static str {
        match self {
            OperationState::Idle => "Idle",
            OperationState::Persisting { .. } => "Persisting",
            OperationState::InstallingSnapshot { .. } => "InstallingSnapshot",
            OperationState::WaitingForPriorSnapshotComplete { .. } => "WaitingForPriorSnapshotComplete",
            OperationState::WaitingForLeaderElected { .. } => "WaitingForLeaderElected",
        }
    }

    fn operation_id(&self) -> Option<u64> {
        match self {
            OperationState::Idle => None,
            OperationState::Persisting { operation, .. }
            | OperationState::InstallingSnapshot { operation, .. }
            | OperationState::WaitingForPriorSnapshotComplete { operation, .. }
            | OperationState::WaitingForLeaderElected { operation, .. } => Some(operation.operation_id),
        }
    }
}

/// MembershipSupport runs server configuration changes one at a time. Requests arriving while one
/// is in flight wait in FIFO order.
pub(crate) struct MembershipSupport {
    logger: slog::Logger,
    state: OperationState,
    pending: VecDeque<ServerOperation>,
    next_operation_id: u64,
}

impl MembershipSupport {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        MembershipSupport {
            logger,
            state: OperationState::Idle,
            pending: VecDeque::new(),
            next_operation_id: 0,
        }
    }

    fn take_state(&mut self) -> OperationState {
        std::mem::replace(&mut self.state, OperationState::Idle)
    }
}

impl Replica {
    pub(crate) fn handle_server_change(
        &mut self,
        request: ServerChangeRequest,
        reply: oneshot::Sender<ServerChangeReply>,
    ) {
        slog::debug!(
            self.membership.logger,
            "{} requested in state {}",
            request.name(),
            self.membership.state.name()
        );

        if let Some(status) = self.reject_server_change(&request) {
            self.send_server_change_reply(Some(reply), status);
            return;
        }

        // Switching ourselves from non-voting to voting when nobody leads: elect a leader with
        // the new configuration so the change can be replicated at all.
        let try_to_elect_leader = match &request {
            ServerChangeRequest::ChangeServersVotingStatus { voting, .. } => {
                voting.get(&self.ctx.my_id) == Some(&true)
                    && !self.ctx.peers.is_voting_member()
                    && self.election.leader_id().is_none()
            }
            _ => false,
        };

        let operation_id = self.membership.next_operation_id;
        self.membership.next_operation_id += 1;
        let operation = ServerOperation {
            operation_id,
            request,
            reply: Some(reply),
            try_to_elect_leader,
        };

        if try_to_elect_leader {
            self.membership_queue_or_start(operation);
        } else {
            self.membership_dispatch(operation);
        }
    }

    fn reject_server_change(&self, request: &ServerChangeRequest) -> Option<ServerChangeStatus> {
        let peers = &self.ctx.peers;
        match request {
            ServerChangeRequest::AddServer { .. } => None,
            ServerChangeRequest::RemoveServer { id } => {
                let is_self = id == &self.ctx.my_id;
                if is_self && peers.is_empty() {
                    Some(ServerChangeStatus::NotSupported)
                } else if !is_self && !peers.contains(id) {
                    Some(ServerChangeStatus::DoesNotExist)
                } else {
                    None
                }
            }
            ServerChangeRequest::ChangeServersVotingStatus { voting, .. } => {
                if voting
                    .keys()
                    .any(|id| id != &self.ctx.my_id && !peers.contains(id))
                {
                    return Some(ServerChangeStatus::DoesNotExist);
                }
                let self_voting = voting
                    .get(&self.ctx.my_id)
                    .copied()
                    .unwrap_or_else(|| peers.is_voting_member());
                let any_peer_voting = peers
                    .iter()
                    .any(|p| voting.get(p.id()).copied().unwrap_or_else(|| p.is_voting()));
                if !self_voting && !any_peer_voting {
                    Some(ServerChangeStatus::InvalidRequest)
                } else {
                    None
                }
            }
        }
    }

    /// Runs the operation here if we lead, otherwise hands it to whoever does.
    fn membership_dispatch(&mut self, operation: ServerOperation) {
        if self.election.role().is_leader() {
            self.membership_queue_or_start(operation);
            return;
        }

        match self.election.leader_id().cloned() {
            Some(leader_id) => {
                slog::debug!(
                    self.membership.logger,
                    "Not leader, forwarding {} to {}",
                    operation.request.name(),
                    leader_id
                );
                if let Some(reply) = operation.reply {
                    self.ctx
                        .send(&leader_id, RaftMessage::ServerChange(operation.request, reply));
                }
            }
            None => {
                slog::debug!(self.membership.logger, "No leader for {}", operation.request.name());
                self.send_server_change_reply(operation.reply, ServerChangeStatus::NoLeader);
            }
        }
    }

    fn membership_queue_or_start(&mut self, operation: ServerOperation) {
        match &self.membership.state {
            OperationState::Idle => self.initiate_server_operation(operation),
            OperationState::Persisting { timed_out: true, .. } => {
                self.send_server_change_reply(operation.reply, ServerChangeStatus::PriorRequestConsensusTimeout);
            }
            state => {
                slog::debug!(
                    self.membership.logger,
                    "{} in progress, queueing {}",
                    state.name(),
                    operation.request.name()
                );
                self.membership.pending.push_back(operation);
            }
        }
    }

    fn initiate_server_operation(&mut self, operation: ServerOperation) {
        slog::debug!(self.membership.logger, "Initiating {:?}", operation.request);
        match operation.request.clone() {
            ServerChangeRequest::AddServer { id, address, voting } => {
                if self.ctx.peers.contains(&id) || id == self.ctx.my_id {
                    self.complete_server_operation(operation, Some(ServerChangeStatus::AlreadyExists));
                    return;
                }
                let voting_state = if voting {
                    VotingState::VotingNotInitialized
                } else {
                    VotingState::NonVoting
                };
                self.ctx.peers.add(id.clone(), address, voting_state);
                self.leader_sync_followers_with_peers();

                if !voting {
                    self.persist_new_server_configuration(operation);
                    return;
                }

                let timeout = self.schedule_operation_timeout(operation.operation_id, self.ctx.options.operation_timeout());
                if self.initiate_capture_snapshot(&id) {
                    slog::debug!(self.membership.logger, "Capturing snapshot for new server {}", id);
                    self.membership.state = OperationState::InstallingSnapshot {
                        operation,
                        _timeout: timeout,
                    };
                } else {
                    slog::debug!(self.membership.logger, "Snapshot already in progress, waiting for it to complete");
                    self.membership.state = OperationState::WaitingForPriorSnapshotComplete {
                        operation,
                        _timeout: timeout,
                    };
                }
            }
            ServerChangeRequest::RemoveServer { id } => {
                self.ctx.peers.remove(&id);
                self.leader_sync_followers_with_peers();
                self.persist_new_server_configuration(operation);
            }
            ServerChangeRequest::ChangeServersVotingStatus { voting, .. } => {
                if operation.try_to_elect_leader {
                    slog::info!(self.membership.logger, "No leader, electing one with the new voting states");
                    let previous_config = self.ctx.peers.server_config(true);
                    self.apply_voting_states(&voting);
                    self.ctx.actor_client.deliver(Event::Raft(RaftMessage::TimeoutNow));
                    let timeout = self.schedule_operation_timeout(operation.operation_id, self.ctx.options.election_timeout());
                    self.membership.state = OperationState::WaitingForLeaderElected {
                        operation,
                        previous_config,
                        _timeout: timeout,
                    };
                } else {
                    self.apply_voting_states(&voting);
                    self.leader_sync_followers_with_peers();
                    self.persist_new_server_configuration(operation);
                }
            }
        }
    }

    fn apply_voting_states(&mut self, voting: &BTreeMap<MemberId, bool>) {
        for (id, is_voting) in voting {
            if id == &self.ctx.my_id {
                self.ctx.peers.set_voting_member(*is_voting);
            } else {
                let state = if *is_voting {
                    VotingState::Voting
                } else {
                    VotingState::NonVoting
                };
                self.ctx.peers.set_voting_state(id, state);
            }
        }
    }

    /// Appends the current configuration to the log and answers Ok. Completion waits for the
    /// entry to be applied.
    fn persist_new_server_configuration(&mut self, operation: ServerOperation) {
        self.ctx.peers.set_dynamic_config_in_use();
        let include_self = match &operation.request {
            ServerChangeRequest::RemoveServer { id } => id != &self.ctx.my_id,
            _ => true,
        };
        let config = self.ctx.peers.server_config(include_self);
        slog::info!(self.membership.logger, "New server configuration {:?}", config.servers);

        match self.leader_replicate(Payload::ServerConfig(config)) {
            Ok(config_index) => {
                let timeout = self.schedule_operation_timeout(operation.operation_id, self.ctx.options.operation_timeout());
                let mut operation = operation;
                self.send_server_change_reply(operation.reply.take(), ServerChangeStatus::Ok);
                self.membership.state = OperationState::Persisting {
                    operation,
                    config_index,
                    timed_out: false,
                    _timeout: timeout,
                };
            }
            Err(e) => {
                slog::error!(self.membership.logger, "Failed to persist server configuration: {}", e);
                self.complete_server_operation(operation, Some(ServerChangeStatus::NoLeader));
            }
        }
    }

    fn schedule_operation_timeout(&self, operation_id: u64, delay: Duration) -> ScheduledTimeout {
        ScheduledTimeout::schedule(
            delay,
            self.ctx.actor_client.clone(),
            TimeoutKind::ServerOperation { operation_id },
        )
    }

    fn send_server_change_reply(&self, reply: Option<oneshot::Sender<ServerChangeReply>>, status: ServerChangeStatus) {
        if let Some(reply) = reply {
            slog::debug!(self.membership.logger, "Replying {:?}", status);
            let _ = reply.send(ServerChangeReply {
                status,
                leader_hint: self.election.leader_id().cloned(),
            });
        }
    }

    /// Ends the operation. `status` is None when the client already got its answer.
    fn complete_server_operation(&mut self, operation: ServerOperation, status: Option<ServerChangeStatus>) {
        let succeeded = status.map_or(true, |s| s == ServerChangeStatus::Ok);
        if let Some(status) = status {
            self.send_server_change_reply(operation.reply, status);
        }

        match &operation.request {
            ServerChangeRequest::RemoveServer { id } => {
                if id == &self.ctx.my_id {
                    self.handle_server_removed(id.clone());
                } else {
                    self.ctx
                        .send(id, RaftMessage::ServerRemoved { server_id: id.clone() });
                }
            }
            ServerChangeRequest::ChangeServersVotingStatus { voting, .. } => {
                let made_self_non_voting = voting.get(&self.ctx.my_id) == Some(&false);
                if succeeded && made_self_non_voting && self.election.role().is_leader() {
                    slog::info!(self.membership.logger, "Leader is now non-voting, transferring leadership");
                    self.start_leadership_transfer(None, None, TransferFollowUp::StepDown);
                }
            }
            ServerChangeRequest::AddServer { .. } => {}
        }

        self.membership_change_to_idle();
    }

    fn membership_change_to_idle(&mut self) {
        self.membership.state = OperationState::Idle;
        if let Some(next) = self.membership.pending.pop_front() {
            self.membership_dispatch(next);
        }
    }

    pub(crate) fn membership_on_apply(&mut self, index: i64) {
        match self.membership.take_state() {
            OperationState::Persisting {
                operation,
                config_index,
                ..
            } if config_index == index => {
                slog::info!(
                    self.membership.logger,
                    "{} replicated to a majority at {}",
                    operation.request.name(),
                    index
                );
                self.complete_server_operation(operation, None);
            }
            state => self.membership.state = state,
        }
    }

    pub(crate) fn membership_on_timeout(&mut self, operation_id: u64) {
        if self.membership.state.operation_id() != Some(operation_id) {
            return;
        }

        match self.membership.take_state() {
            OperationState::Persisting {
                operation,
                config_index,
                _timeout,
                ..
            } => {
                slog::warn!(
                    self.membership.logger,
                    "Timed out replicating the server configuration for {}",
                    operation.request.name()
                );
                while let Some(pending) = self.membership.pending.pop_front() {
                    self.send_server_change_reply(pending.reply, ServerChangeStatus::PriorRequestConsensusTimeout);
                }
                self.membership.state = OperationState::Persisting {
                    operation,
                    config_index,
                    timed_out: true,
                    _timeout,
                };
            }
            OperationState::InstallingSnapshot { operation, .. }
            | OperationState::WaitingForPriorSnapshotComplete { operation, .. } => {
                slog::warn!(
                    self.membership.logger,
                    "Timed out installing a snapshot on new server {:?}",
                    operation.new_server_id()
                );
                self.abandon_new_server(operation);
            }
            OperationState::WaitingForLeaderElected {
                operation,
                previous_config,
                ..
            } => {
                slog::warn!(
                    self.membership.logger,
                    "Leader election timed out, cannot apply {}",
                    operation.request.name()
                );
                self.ctx.peers.update_from_config(&previous_config);
                self.become_follower(None);
                self.forward_to_another_server(operation);
            }
            OperationState::Idle => {}
        }
    }

    /// Forgets a server whose snapshot never arrived. It never made it into a configuration.
    fn abandon_new_server(&mut self, operation: ServerOperation) {
        if let Some(id) = operation.new_server_id() {
            self.ctx.peers.remove(id);
        }
        let status = if self.election.role().is_leader() {
            self.leader_sync_followers_with_peers();
            ServerChangeStatus::Timeout
        } else {
            ServerChangeStatus::NoLeader
        };
        self.complete_server_operation(operation, Some(status));
    }

    /// Passes a voting change on to another member that is about to become voting and that
    /// hasn't tried yet.
    fn forward_to_another_server(&mut self, mut operation: ServerOperation) {
        let (voting, mut servers_visited) = match &operation.request {
            ServerChangeRequest::ChangeServersVotingStatus { voting, servers_visited } => {
                (voting.clone(), servers_visited.clone())
            }
            _ => return,
        };
        servers_visited.push(self.ctx.my_id.clone());

        let target = voting.iter().find_map(|(id, is_voting)| {
            let peer = self.ctx.peers.get(id)?;
            if *is_voting && !peer.is_voting() && !servers_visited.contains(id) {
                Some(id.clone())
            } else {
                None
            }
        });

        match (target, operation.reply.take()) {
            (Some(target), Some(reply)) => {
                slog::info!(self.membership.logger, "Forwarding voting change to {}", target);
                self.ctx.send(
                    &target,
                    RaftMessage::ServerChange(
                        ServerChangeRequest::ChangeServersVotingStatus { voting, servers_visited },
                        reply,
                    ),
                );
                self.membership_change_to_idle();
            }
            (_, reply) => {
                operation.reply = reply;
                self.complete_server_operation(operation, Some(ServerChangeStatus::NoLeader));
            }
        }
    }

    pub(crate) fn membership_on_new_leader(&mut self, leader_id: &MemberId) {
        match self.membership.take_state() {
            OperationState::WaitingForLeaderElected {
                operation,
                previous_config,
                ..
            } => {
                slog::debug!(self.membership.logger, "New leader {} elected", leader_id);
                if self.election.role().is_leader() {
                    self.persist_new_server_configuration(operation);
                } else {
                    // Someone else won. Undo the local change and let them run it.
                    self.ctx.peers.update_from_config(&previous_config);
                    self.membership_change_to_idle();
                    self.membership_dispatch(operation);
                }
            }
            state => self.membership.state = state,
        }
    }

    pub(crate) fn membership_on_snapshot_complete(&mut self) {
        match self.membership.take_state() {
            OperationState::WaitingForPriorSnapshotComplete { operation, _timeout } => {
                if !self.election.role().is_leader() {
                    slog::debug!(self.membership.logger, "Prior snapshot complete but no longer leader");
                    self.membership.state = OperationState::WaitingForPriorSnapshotComplete { operation, _timeout };
                    return;
                }
                let id = match operation.new_server_id() {
                    Some(id) => id.clone(),
                    None => return,
                };
                if self.initiate_capture_snapshot(&id) {
                    slog::debug!(self.membership.logger, "Capturing snapshot for new server {}", id);
                    let timeout = self.schedule_operation_timeout(operation.operation_id, self.ctx.options.operation_timeout());
                    self.membership.state = OperationState::InstallingSnapshot {
                        operation,
                        _timeout: timeout,
                    };
                } else {
                    self.membership.state = OperationState::WaitingForPriorSnapshotComplete { operation, _timeout };
                }
            }
            state => self.membership.state = state,
        }
    }

    pub(crate) fn membership_on_uninitialized_follower_snapshot_reply(&mut self, follower_id: &MemberId) {
        match self.membership.take_state() {
            OperationState::InstallingSnapshot { operation, _timeout }
                if operation.new_server_id() == Some(follower_id) && self.election.role().is_leader() =>
            {
                slog::info!(self.membership.logger, "New server {} has its snapshot, now voting", follower_id);
                self.ctx.peers.set_voting_state(follower_id, VotingState::Voting);
                self.leader_sync_followers_with_peers();
                self.persist_new_server_configuration(operation);
            }
            state => {
                slog::debug!(
                    self.membership.logger,
                    "Dropping snapshot reply from uninitialized follower {} in state {}",
                    follower_id,
                    state.name()
                );
                self.membership.state = state;
            }
        }
    }

    /// Queued operations go to the new leader. A new server waiting on our snapshot is dropped.
    pub(crate) fn membership_on_leadership_lost(&mut self) {
        match self.membership.take_state() {
            OperationState::InstallingSnapshot { operation, .. }
            | OperationState::WaitingForPriorSnapshotComplete { operation, .. } => {
                self.abandon_new_server(operation);
            }
            OperationState::Persisting { operation, .. } => {
                slog::info!(
                    self.membership.logger,
                    "Lost leadership before {} was applied",
                    operation.request.name()
                );
                self.membership_change_to_idle();
            }
            state => self.membership.state = state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::test_harness::TestCluster;
    use crate::replica::{RaftRole, VotingState};
    use tokio::sync::oneshot;

    fn change(cluster: &mut TestCluster, on: &str, request: ServerChangeRequest) -> oneshot::Receiver<ServerChangeReply> {
        let (tx, rx) = oneshot::channel();
        cluster.replica_mut(on).handle_server_change(request, tx);
        rx
    }

    fn voting(changes: &[(&str, bool)]) -> ServerChangeRequest {
        ServerChangeRequest::ChangeServersVotingStatus {
            voting: changes.iter().map(|(id, v)| (MemberId::new(*id), *v)).collect(),
            servers_visited: Vec::new(),
        }
    }

    fn peer_state(cluster: &TestCluster, on: &str, peer: &str) -> Option<VotingState> {
        cluster
            .state(on)
            .peers
            .iter()
            .find(|p| p.id == MemberId::new(peer))
            .map(|p| p.voting_state)
    }

    #[tokio::test]
    async fn non_voting_server_joins_and_replicates() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.submit("a", "before").await.unwrap();
        cluster.add_member("d", &["a", "b", "c"]);

        let rx = change(
            &mut cluster,
            "a",
            ServerChangeRequest::AddServer {
                id: MemberId::new("d"),
                address: None,
                voting: false,
            },
        );
        cluster.settle().await;
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::Ok);

        for _ in 0..3 {
            cluster.heartbeat("a");
            cluster.settle().await;
        }
        assert_eq!(peer_state(&cluster, "a", "d"), Some(VotingState::NonVoting));
        assert_eq!(peer_state(&cluster, "b", "d"), Some(VotingState::NonVoting));
        assert_eq!(cluster.state("d").commit_index, cluster.state("a").commit_index);
        assert!(!cluster.state("d").is_voting);
    }

    #[tokio::test]
    async fn voting_server_gets_a_snapshot_before_it_votes() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.submit("a", "before").await.unwrap();
        cluster.add_member("d", &["a", "b", "c"]);

        let rx = change(
            &mut cluster,
            "a",
            ServerChangeRequest::AddServer {
                id: MemberId::new("d"),
                address: Some("local://d".to_string()),
                voting: true,
            },
        );
        assert_eq!(peer_state(&cluster, "a", "d"), Some(VotingState::VotingNotInitialized));
        cluster.settle().await;
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::Ok);

        cluster.heartbeat("a");
        cluster.settle().await;
        assert_eq!(peer_state(&cluster, "a", "d"), Some(VotingState::Voting));
        assert_eq!(peer_state(&cluster, "c", "d"), Some(VotingState::Voting));
        assert_eq!(cluster.applied_indexes("d"), vec![0]);
        assert!(cluster.state("d").is_voting);
    }

    #[tokio::test]
    async fn adding_an_existing_server_is_rejected() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;

        let rx = change(
            &mut cluster,
            "a",
            ServerChangeRequest::AddServer {
                id: MemberId::new("b"),
                address: None,
                voting: true,
            },
        );
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, ServerChangeStatus::AlreadyExists);
        assert_eq!(reply.leader_hint, Some(MemberId::new("a")));
    }

    #[tokio::test]
    async fn removed_server_is_told_and_drops_its_peers() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;

        let rx = change(&mut cluster, "a", ServerChangeRequest::RemoveServer { id: MemberId::new("c") });
        cluster.settle().await;
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::Ok);
        cluster.heartbeat("a");
        cluster.settle().await;

        assert_eq!(peer_state(&cluster, "a", "c"), None);
        assert_eq!(peer_state(&cluster, "b", "c"), None);
        let c = cluster.state("c");
        assert!(c.peers.is_empty());
        assert!(!c.is_voting);

        // Two voting members left, both must agree.
        cluster.submit("a", "after").await.unwrap();
        cluster.heartbeat("a");
        cluster.settle().await;
        assert_eq!(cluster.applied_indexes("b").last(), Some(&cluster.state("a").last_index));
    }

    #[tokio::test]
    async fn remove_rejects_unknown_server_and_lone_self() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        let rx = change(&mut cluster, "a", ServerChangeRequest::RemoveServer { id: MemberId::new("x") });
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::DoesNotExist);

        let mut solo = TestCluster::new(&["solo"]);
        solo.start();
        solo.settle().await;
        let rx = change(&mut solo, "solo", ServerChangeRequest::RemoveServer { id: MemberId::new("solo") });
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::NotSupported);
    }

    #[tokio::test]
    async fn follower_forwards_to_the_leader() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.add_member("d", &["a", "b", "c"]);

        let rx = change(
            &mut cluster,
            "b",
            ServerChangeRequest::AddServer {
                id: MemberId::new("d"),
                address: None,
                voting: false,
            },
        );
        cluster.settle().await;
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, ServerChangeStatus::Ok);
        assert_eq!(reply.leader_hint, Some(MemberId::new("a")));
        assert_eq!(peer_state(&cluster, "a", "d"), Some(VotingState::NonVoting));
    }

    #[tokio::test]
    async fn no_leader_means_no_change() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();

        let rx = change(&mut cluster, "b", ServerChangeRequest::RemoveServer { id: MemberId::new("c") });
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, ServerChangeStatus::NoLeader);
        assert_eq!(reply.leader_hint, None);
    }

    #[tokio::test]
    async fn voting_change_must_leave_a_voter() {
        let mut cluster = TestCluster::new(&["a", "b"]);
        cluster.start();
        cluster.elect("a").await;

        let rx = change(&mut cluster, "a", voting(&[("a", false), ("b", false)]));
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::InvalidRequest);
        let rx = change(&mut cluster, "a", voting(&[("z", true)]));
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::DoesNotExist);
    }

    #[tokio::test]
    async fn leader_made_non_voting_hands_over_leadership() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;

        let rx = change(&mut cluster, "a", voting(&[("a", false)]));
        cluster.settle().await;
        assert_eq!(rx.await.unwrap().status, ServerChangeStatus::Ok);
        cluster.settle().await;

        let a = cluster.state("a");
        assert_eq!(a.role, RaftRole::Follower);
        assert!(!a.is_voting);
        let new_leader = a.leader_id.expect("a new leader");
        assert_ne!(new_leader, MemberId::new("a"));
        assert_eq!(cluster.state(new_leader.as_str()).role, RaftRole::Leader);
    }

    #[tokio::test]
    async fn requests_after_a_consensus_timeout_are_refused() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.transport.isolate(&MemberId::new("b"));
        cluster.transport.isolate(&MemberId::new("c"));

        let first = change(&mut cluster, "a", ServerChangeRequest::RemoveServer { id: MemberId::new("c") });
        assert_eq!(first.await.unwrap().status, ServerChangeStatus::Ok);
        let queued = change(&mut cluster, "a", voting(&[("b", false)]));

        cluster.replica_mut("a").membership_on_timeout(0);
        assert_eq!(
            queued.await.unwrap().status,
            ServerChangeStatus::PriorRequestConsensusTimeout
        );
        let later = change(&mut cluster, "a", voting(&[("b", false)]));
        assert_eq!(
            later.await.unwrap().status,
            ServerChangeStatus::PriorRequestConsensusTimeout
        );
    }
}
