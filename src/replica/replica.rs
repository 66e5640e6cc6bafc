use crate::actor::{Callback, Event, WeakActorClient};
use crate::replica::context::{RaftContext, ReplicaOptions};
use crate::replica::election::{ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::leadership_transfer::LeadershipTransfer;
use crate::replica::log_entry::Payload;
use crate::replica::membership::MembershipSupport;
use crate::replica::messages::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, RaftMessage, RequestVote,
    RequestVoteReply, INVALID_CHUNK_INDEX,
};
use crate::replica::peers::{MemberId, PeerAddressResolver, PeerInfo, Peers, ServerConfigurationPayload};
use crate::replica::persistence::{
    DataPersistenceProvider, JournalRecord, PersistCallback, PersistContinuation, PersistenceError, SnapshotCallback,
    SnapshotMetadata,
};
use crate::replica::recovery;
use crate::replica::replica_api::{
    FollowerSummary, PeerSummary, RaftRole, RaftState, SnapshotRequestError, SubmitError, SubmitOutput,
    SwitchBehaviorError,
};
use crate::replica::replicated_log::ReplicatedLog;
use crate::replica::snapshot::{
    ApplySnapshot, CaptureRequest, CommitOutcome, InstallSnapshotReplyTarget, SnapshotManager,
};
use crate::replica::state_machine::RaftStateMachine;
use crate::replica::term_info::{Term, TermInfoStore};
use crate::replica::timers::{ScheduledTimeout, TimeoutKind};
use crate::replica::transport::RaftTransport;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

/// How long a leader tries to hand over leadership before it shuts down anyway.
const SHUTDOWN_TRANSFER_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct ReplicaConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) my_id: MemberId,
    pub(crate) peers: Vec<PeerInfo>,
    pub(crate) address_resolver: Option<Arc<dyn PeerAddressResolver>>,
    pub(crate) options: ReplicaOptions,
    pub(crate) term_store: Box<dyn TermInfoStore>,
    pub(crate) persistence: Box<dyn DataPersistenceProvider>,
    pub(crate) state_machine: Box<dyn RaftStateMachine>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) actor_client: WeakActorClient,
}

/// Builds a replica from durable state. Fails if the journal, snapshot or term store can't be
/// recovered.
pub(crate) fn create_replica(config: ReplicaConfig) -> Result<(Replica, ElectionStateChangeListener), PersistenceError> {
    let logger = config.logger;
    let peers = Peers::new(
        logger.new(slog::o!("Component" => "Peers")),
        config.my_id.clone(),
        config.peers,
        config.address_resolver,
    );

    let mut ctx = RaftContext {
        logger: logger.clone(),
        my_id: config.my_id.clone(),
        term_store: config.term_store,
        persistence: config.persistence,
        log: ReplicatedLog::new(logger.clone()),
        peers,
        snapshot_manager: SnapshotManager::new(logger.clone()),
        state_machine: config.state_machine,
        transport: config.transport,
        actor_client: config.actor_client.clone(),
        commit_index: -1,
        last_applied: -1,
        replicated_to_all_index: -1,
        options: config.options,
    };
    recovery::recover(&mut ctx)?;

    let (election, listener) = ElectionState::new_follower(
        ElectionConfig {
            my_id: config.my_id.clone(),
            leader_heartbeat_duration: ctx.options.leader_heartbeat_duration,
            follower_min_timeout: ctx.options.follower_min_timeout,
            follower_max_timeout: ctx.options.follower_max_timeout,
            spawn_timers: ctx.options.spawn_timers,
        },
        config.actor_client,
        ctx.current_term(),
    );
    let membership = MembershipSupport::new(logger.new(slog::o!("Component" => "Membership")));

    let replica = Replica {
        ctx,
        election,
        membership,
        transfer: None,
        next_transfer_id: 0,
        shutdown: None,
        last_known_leader: None,
        stopped: false,
    };
    Ok((replica, listener))
}

/// Shutdown waiting for a leadership transfer to finish first.
pub(super) struct PendingShutdown {
    pub(super) waiters: Vec<oneshot::Sender<()>>,
    pub(super) _timeout: ScheduledTimeout,
}

/// Replica is one raft member. It's driven by `ReplicaActor`, one event at a time, and nothing in
/// here blocks except synchronous journal writes.
///
/// Role specific handling lives next to the role in `election::{follower, candidate, leader}`,
/// membership changes in `membership` and leadership transfer in `leadership_transfer`.
pub(crate) struct Replica {
    pub(super) ctx: RaftContext,
    pub(super) election: ElectionState,
    pub(super) membership: MembershipSupport,
    pub(super) transfer: Option<LeadershipTransfer>,
    pub(super) next_transfer_id: u64,
    pub(super) shutdown: Option<PendingShutdown>,
    last_known_leader: Option<MemberId>,
    stopped: bool,
}

impl Replica {
    pub(crate) fn start(&mut self) {
        slog::info!(
            self.ctx.logger,
            "Starting as follower in term {:?}, last index {}, last applied {}, {} peers",
            self.ctx.current_term(),
            self.ctx.log.last_index(),
            self.ctx.last_applied,
            self.ctx.peers.len()
        );
        self.maybe_elect_self();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn handle_raft_message(&mut self, message: RaftMessage) {
        if let Some(term) = message.term() {
            // > If RPC request or response contains term T > currentTerm:
            // > set currentTerm = T, convert to follower (§5.1)
            if term > self.ctx.current_term() {
                slog::info!(
                    self.ctx.logger,
                    "Received {} with term {:?} newer than ours {:?}",
                    message.name(),
                    term,
                    self.ctx.current_term()
                );
                if self.ctx.persist_term(term, None).is_err() {
                    return;
                }
                if self.election.role() != RaftRole::Follower {
                    self.become_follower(None);
                }
            }
        }

        match message {
            RaftMessage::RequestVote(request) => self.handle_request_vote(request),
            RaftMessage::RequestVoteReply(reply) => self.candidate_handle_request_vote_reply(reply),
            RaftMessage::AppendEntries(request) => self.handle_append_entries(request),
            RaftMessage::AppendEntriesReply(reply) => self.leader_handle_append_entries_reply(reply),
            RaftMessage::InstallSnapshot(request) => self.handle_install_snapshot(request),
            RaftMessage::InstallSnapshotReply(reply) => self.leader_handle_install_snapshot_reply(reply),
            RaftMessage::TimeoutNow => {
                if self.election.role() == RaftRole::Follower {
                    self.follower_handle_election_timeout(true);
                } else {
                    slog::debug!(self.ctx.logger, "Ignoring TimeoutNow as {:?}", self.election.role());
                }
            }
            RaftMessage::LeaderTransitioning { leader_id } => {
                if self.election.leader_id() == Some(&leader_id) && !self.election.role().is_leader() {
                    slog::debug!(self.ctx.logger, "Leader {} is transitioning, forgetting it", leader_id);
                    self.election.set_leader_if_follower(None, self.ctx.current_term());
                }
            }
            RaftMessage::ServerRemoved { server_id } => self.handle_server_removed(server_id),
            RaftMessage::ServerChange(request, reply) => self.handle_server_change(request, reply),
        }
    }

    fn handle_request_vote(&mut self, request: RequestVote) {
        let vote_granted = self.can_grant_vote(&request)
            && self
                .ctx
                .persist_term(request.term, Some(request.candidate_id.clone()))
                .is_ok();

        slog::debug!(
            self.ctx.logger,
            "RequestVote from {} for term {:?}: granted {}",
            request.candidate_id,
            request.term,
            vote_granted
        );
        // Granting a vote counts as hearing from a would-be leader.
        if vote_granted {
            if let Some(follower) = self.election.follower_mut() {
                follower.restart_last_leader_message_timer();
            }
        }

        self.ctx.send(
            &request.candidate_id,
            RaftMessage::RequestVoteReply(RequestVoteReply {
                term: self.ctx.current_term(),
                voter_id: self.ctx.my_id.clone(),
                vote_granted,
            }),
        );
    }

    fn can_grant_vote(&self, request: &RequestVote) -> bool {
        // > Reply false if term < currentTerm (§5.1)
        if request.term < self.ctx.current_term() {
            return false;
        }

        // > If votedFor is null or candidateId, and candidate’s log is at
        // > least as up-to-date as receiver’s log, grant vote (§5.2, §5.4)
        if let Some(voted_for) = self.ctx.voted_for() {
            if voted_for != &request.candidate_id {
                return false;
            }
        }

        let last_term = self.ctx.log.last_term();
        request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= self.ctx.log.last_index())
    }

    fn handle_append_entries(&mut self, request: AppendEntries) {
        // > Reply false if term < currentTerm (§5.1)
        if request.term < self.ctx.current_term() {
            slog::debug!(
                self.ctx.logger,
                "Rejecting AppendEntries from {} with stale term {:?}",
                request.leader_id,
                request.term
            );
            self.ctx.send(
                &request.leader_id,
                RaftMessage::AppendEntriesReply(AppendEntriesReply {
                    follower_id: self.ctx.my_id.clone(),
                    term: self.ctx.current_term(),
                    success: false,
                    log_last_index: self.ctx.log.last_index(),
                    log_last_term: self.ctx.log.last_term(),
                    force_install_snapshot: false,
                }),
            );
            return;
        }

        match self.election.role() {
            RaftRole::Follower => self.follower_handle_append_entries(request),
            RaftRole::Candidate => {
                // > If AppendEntries RPC received from new leader: convert to follower
                self.become_follower(Some(request.leader_id.clone()));
                self.follower_handle_append_entries(request);
            }
            RaftRole::Leader | RaftRole::IsolatedLeader => {
                slog::warn!(
                    self.ctx.logger,
                    "Ignoring AppendEntries from {} in our own term {:?}",
                    request.leader_id,
                    request.term
                );
            }
        }
    }

    fn handle_install_snapshot(&mut self, request: InstallSnapshot) {
        if request.term < self.ctx.current_term() {
            self.ctx.send(
                &request.leader_id,
                RaftMessage::InstallSnapshotReply(InstallSnapshotReply {
                    term: self.ctx.current_term(),
                    follower_id: self.ctx.my_id.clone(),
                    chunk_index: request.chunk_index,
                    success: false,
                }),
            );
            return;
        }

        match self.election.role() {
            RaftRole::Follower => self.follower_handle_install_snapshot(request),
            RaftRole::Candidate => {
                self.become_follower(Some(request.leader_id.clone()));
                self.follower_handle_install_snapshot(request);
            }
            RaftRole::Leader | RaftRole::IsolatedLeader => {
                slog::warn!(
                    self.ctx.logger,
                    "Ignoring InstallSnapshot from {} in our own term {:?}",
                    request.leader_id,
                    request.term
                );
            }
        }
    }

    pub(crate) fn handle_server_removed(&mut self, server_id: MemberId) {
        if server_id != self.ctx.my_id {
            return;
        }
        slog::info!(self.ctx.logger, "Removed from the cluster, dropping all peers");
        self.ctx
            .peers
            .update_from_config(&ServerConfigurationPayload { servers: Vec::new() });
        if self.election.role() == RaftRole::Follower {
            self.election.set_leader_if_follower(None, self.ctx.current_term());
        } else {
            self.become_follower(None);
        }
    }

    pub(crate) fn submit(&mut self, data: Bytes, callback: Callback<SubmitOutput, SubmitError>) {
        if !self.election.role().is_leader() {
            callback.send(Err(SubmitError::NotLeader {
                leader_hint: self.election.leader_id().cloned(),
            }));
            return;
        }

        let term = self.ctx.current_term();
        match self.leader_replicate(Payload::Command(data)) {
            Ok(index) => {
                if let Some(leader) = self.election.leader_mut() {
                    leader
                        .client_requests
                        .push_back(crate::replica::election::ClientRequestTracker { index, term, callback });
                }
            }
            Err(e) => callback.send(Err(SubmitError::Persistence(e))),
        }
    }

    pub(crate) fn follower_timeout(&mut self) {
        match self.election.role() {
            RaftRole::Follower => self.follower_handle_election_timeout(false),
            RaftRole::Candidate => self.candidate_handle_election_timeout(),
            RaftRole::Leader | RaftRole::IsolatedLeader => {}
        }
    }

    pub(crate) fn handle_timeout(&mut self, kind: TimeoutKind) {
        match kind {
            TimeoutKind::ServerOperation { operation_id } => self.membership_on_timeout(operation_id),
            TimeoutKind::NewLeader { transfer_id } => self.transfer_on_timeout(transfer_id),
            TimeoutKind::Shutdown => {
                if self.shutdown.is_some() {
                    slog::warn!(self.ctx.logger, "Leadership transfer did not finish in time, shutting down anyway");
                    self.finish_shutdown();
                }
            }
        }
    }

    pub(crate) fn persist_completed(&mut self, continuation: PersistContinuation, result: Result<(), PersistenceError>) {
        match (continuation, result) {
            (PersistContinuation::Entry { index }, Ok(())) => {
                self.ctx.log.mark_persisted(index);
                self.capture_snapshot_if_ready(index);
                if self.election.role().is_leader() {
                    self.leader_commit_and_apply();
                }
            }
            (PersistContinuation::Entry { index }, Err(e)) => {
                slog::error!(self.ctx.logger, "Failed to persist entry {}: {}", index, e);
                if let Some(leader) = self.election.leader_mut() {
                    if let Some(position) = leader.client_requests.iter().position(|r| r.index == index) {
                        if let Some(request) = leader.client_requests.remove(position) {
                            request.callback.send(Err(SubmitError::Persistence(e)));
                        }
                    }
                    self.become_follower(None);
                }
            }
            (PersistContinuation::Bookkeeping, Ok(())) => {}
            (PersistContinuation::Bookkeeping, Err(e)) => {
                slog::error!(self.ctx.logger, "Failed to persist journal bookkeeping: {}", e);
            }
        }
    }

    /// Applies committed entries up to `index`, in order, each exactly once.
    pub(crate) fn apply_log_to_state_machine(&mut self, index: i64) {
        let to_index = index.min(self.ctx.commit_index);
        let mut applied = self.ctx.last_applied;
        let mut applied_configs = Vec::new();

        for i in (self.ctx.last_applied + 1)..=to_index {
            let entry = match self.ctx.log.get(i) {
                Some(entry) => entry.clone(),
                None => {
                    slog::warn!(self.ctx.logger, "Missing entry {} while applying up to {}", i, to_index);
                    break;
                }
            };

            match &entry.payload {
                Payload::Command(command) => self.ctx.state_machine.apply_command(i, command),
                Payload::ServerConfig(_) => applied_configs.push(i),
                Payload::Noop => {}
            }
            applied = i;

            if let Some(leader) = self.election.leader_mut() {
                while leader.client_requests.front().map_or(false, |r| r.index <= i) {
                    if let Some(request) = leader.client_requests.pop_front() {
                        if request.index == i && request.term == entry.term {
                            request.callback.send(Ok(SubmitOutput {
                                index: i,
                                term: entry.term,
                            }));
                        } else {
                            request.callback.send(Err(SubmitError::NotLeader {
                                leader_hint: Some(self.ctx.my_id.clone()),
                            }));
                        }
                    }
                }
            }
        }

        if applied > self.ctx.last_applied {
            slog::debug!(self.ctx.logger, "Applied entries {}..={}", self.ctx.last_applied + 1, applied);
            self.ctx.last_applied = applied;
            self.ctx.persistence.persist_async(
                JournalRecord::ApplyJournalEntries { to_index: applied },
                PersistCallback::new(self.ctx.actor_client.clone(), PersistContinuation::Bookkeeping),
            );
        }

        for config_index in applied_configs {
            self.membership_on_apply(config_index);
        }
    }

    pub(crate) fn capture_snapshot(&mut self) -> Result<(), SnapshotRequestError> {
        if self.start_capture(true, None) {
            Ok(())
        } else {
            Err(SnapshotRequestError::AlreadyInProgress)
        }
    }

    pub(crate) fn capture_snapshot_if_ready(&mut self, index: i64) {
        let thresholds = self.ctx.options.snapshot_thresholds();
        if self
            .ctx
            .log
            .should_capture_snapshot(index, thresholds.batch_count, thresholds.data_threshold)
        {
            self.start_capture(false, None);
        }
    }

    /// Starts a snapshot capture. The state machine's state comes back as a mailbox event.
    pub(crate) fn start_capture(&mut self, mandatory_trim: bool, install_target: Option<MemberId>) -> bool {
        let ctx = &mut self.ctx;
        let request = CaptureRequest {
            last_entry: ctx.log.last(),
            replicated_to_all_index: ctx.replicated_to_all_index,
            last_applied: ctx.last_applied,
            mandatory_trim,
            install_target,
        };
        if !ctx.snapshot_manager.capture(request, &ctx.log, ctx.persistence.as_ref()) {
            return false;
        }

        let state = ctx.state_machine.take_snapshot();
        ctx.actor_client.deliver(Event::CaptureSnapshotReply(state));
        true
    }

    pub(crate) fn capture_snapshot_reply(&mut self, state: Bytes) {
        let is_leader = self.election.role().is_leader();
        let ctx = &mut self.ctx;
        let term_info = ctx.term_info();
        let server_config = ctx.peers.dynamic_server_config();
        let thresholds = ctx.options.snapshot_thresholds();
        let callback = SnapshotCallback::new(ctx.actor_client.clone());

        let outcome = ctx.snapshot_manager.persist(
            state,
            &mut ctx.log,
            ctx.persistence.as_mut(),
            term_info,
            server_config,
            thresholds,
            is_leader,
            callback,
        );

        if let Some(index) = outcome.replicated_to_all_index {
            ctx.replicated_to_all_index = index;
        }
        if let Some(snapshot) = outcome.install {
            self.leader_install_captured_snapshot(snapshot);
        }
    }

    pub(crate) fn snapshot_saved(&mut self, result: Result<SnapshotMetadata, PersistenceError>) {
        let ctx = &mut self.ctx;
        let (outcome, success) = match result {
            Ok(metadata) => (
                ctx.snapshot_manager
                    .commit(&metadata, &mut ctx.log, ctx.persistence.as_mut()),
                true,
            ),
            Err(e) => {
                slog::error!(ctx.logger, "Failed to save snapshot: {}", e);
                (ctx.snapshot_manager.rollback(&mut ctx.log), false)
            }
        };

        match outcome {
            None => return,
            Some(CommitOutcome::Captured) => {}
            Some(CommitOutcome::Applied(apply)) if success => self.install_applied_snapshot(apply),
            Some(CommitOutcome::Applied(apply)) => self.reply_snapshot_not_applied(apply.reply),
        }
        self.membership_on_snapshot_complete();
    }

    fn reply_snapshot_not_applied(&self, reply: Option<InstallSnapshotReplyTarget>) {
        if let Some(target) = reply {
            self.ctx.send(
                &target.leader_id,
                RaftMessage::InstallSnapshotReply(InstallSnapshotReply {
                    term: self.ctx.current_term(),
                    follower_id: self.ctx.my_id.clone(),
                    chunk_index: INVALID_CHUNK_INDEX,
                    success: false,
                }),
            );
        }
    }

    /// A leader's snapshot is durable, make it our state. Nothing changes unless its term is
    /// durable too.
    fn install_applied_snapshot(&mut self, apply: ApplySnapshot) {
        let snapshot = apply.snapshot;
        if snapshot.term_info.term > self.ctx.current_term() {
            if let Err(e) = self
                .ctx
                .persist_term(snapshot.term_info.term, snapshot.term_info.voted_for.clone())
            {
                slog::error!(self.ctx.logger, "Not applying snapshot from leader, its term is not durable: {}", e);
                self.reply_snapshot_not_applied(apply.reply);
                return;
            }
        }

        let ctx = &mut self.ctx;
        ctx.log.reset_to_snapshot(&snapshot);
        ctx.commit_index = snapshot.last_applied_index;
        ctx.last_applied = snapshot.last_applied_index;
        if let Some(config) = &snapshot.server_config {
            ctx.peers.update_from_config(config);
        }
        ctx.state_machine.apply_snapshot(&snapshot.state);

        slog::info!(
            ctx.logger,
            "Applied snapshot from leader: last applied {} term {:?}",
            snapshot.last_applied_index,
            snapshot.last_applied_term
        );

        if let Some(target) = apply.reply {
            ctx.send(
                &target.leader_id,
                RaftMessage::InstallSnapshotReply(InstallSnapshotReply {
                    term: ctx.current_term(),
                    follower_id: ctx.my_id.clone(),
                    chunk_index: target.chunk_index,
                    success: true,
                }),
            );
        }
    }

    pub(crate) fn get_state(&self) -> RaftState {
        let ctx = &self.ctx;
        let mut peers: Vec<PeerSummary> = ctx
            .peers
            .iter()
            .map(|p| PeerSummary {
                id: p.id().clone(),
                address: p.address().map(str::to_string),
                voting_state: p.voting_state(),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        let election_timeout = ctx.options.election_timeout();
        let mut followers: Vec<FollowerSummary> = match self.election.leader() {
            Some(leader) => leader
                .tracker
                .followers()
                .map(|f| f.summary(election_timeout))
                .collect(),
            None => Vec::new(),
        };
        followers.sort_by(|a, b| a.id.cmp(&b.id));

        RaftState {
            member_id: ctx.my_id.clone(),
            role: self.election.role(),
            term: ctx.current_term(),
            voted_for: ctx.voted_for().cloned(),
            leader_id: self.election.leader_id().cloned(),
            is_voting: ctx.peers.is_voting_member(),
            commit_index: ctx.commit_index,
            last_applied: ctx.last_applied,
            last_index: ctx.log.last_index(),
            last_term: ctx.log.last_term(),
            snapshot_index: ctx.log.snapshot_index(),
            snapshot_term: ctx.log.snapshot_term(),
            replicated_to_all_index: ctx.replicated_to_all_index,
            in_memory_journal_size: ctx.log.size(),
            in_memory_journal_data_size: ctx.log.data_size(),
            is_snapshot_capture_in_progress: ctx.snapshot_manager.is_capturing(),
            peers,
            followers,
        }
    }

    /// Forces a role while elections are disabled. Used to pin a member's role from outside.
    pub(crate) fn switch_behavior(&mut self, role: RaftRole, term: Term) -> Result<(), SwitchBehaviorError> {
        if self.ctx.options.elections_enabled {
            return Err(SwitchBehaviorError::ElectionsEnabled);
        }
        if matches!(role, RaftRole::Candidate | RaftRole::IsolatedLeader) {
            return Err(SwitchBehaviorError::UnsupportedRole(role));
        }

        if term > self.ctx.current_term() {
            self.ctx
                .persist_term(term, None)
                .map_err(SwitchBehaviorError::Persistence)?;
        }

        slog::info!(self.ctx.logger, "Switching to {:?} in term {:?}", role, self.ctx.current_term());
        match role {
            RaftRole::Leader => {
                if !self.election.role().is_leader() {
                    self.become_leader();
                }
            }
            _ => self.become_follower(None),
        }
        Ok(())
    }

    pub(crate) fn shutdown(&mut self, done: oneshot::Sender<()>) {
        if let Some(pending) = &mut self.shutdown {
            pending.waiters.push(done);
            return;
        }

        if !self.election.role().is_leader() || !self.ctx.peers.any_voting_peers() {
            self.finish_shutdown();
            let _ = done.send(());
            return;
        }

        slog::info!(self.ctx.logger, "Transferring leadership before shutting down");
        self.shutdown = Some(PendingShutdown {
            waiters: vec![done],
            _timeout: ScheduledTimeout::schedule(
                SHUTDOWN_TRANSFER_TIMEOUT,
                self.ctx.actor_client.clone(),
                TimeoutKind::Shutdown,
            ),
        });
        self.start_leadership_transfer(None, None, TransferFollowUp::Shutdown);
    }

    pub(crate) fn finish_shutdown(&mut self) {
        if self.stopped {
            return;
        }
        if let Some(leader) = self.election.take_leader_state() {
            for request in leader.client_requests {
                request.callback.send(Err(SubmitError::NotLeader { leader_hint: None }));
            }
        }
        self.abort_leadership_transfer();
        self.election.stop(self.ctx.current_term());
        self.stopped = true;
        slog::info!(self.ctx.logger, "Replica stopped");

        if let Some(pending) = self.shutdown.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Runs after every event, observing leader changes whatever caused them.
    pub(crate) fn after_event(&mut self) {
        if self.stopped {
            return;
        }
        let leader = self.election.leader_id().cloned();
        if leader != self.last_known_leader {
            self.last_known_leader = leader.clone();
            if let Some(leader) = leader {
                slog::info!(self.ctx.logger, "New leader {} in term {:?}", leader, self.ctx.current_term());
                self.transfer_on_new_leader(&leader);
                self.membership_on_new_leader(&leader);
            }
        }
    }

    /// Steps down, failing the client requests we were tracking as leader.
    pub(crate) fn become_follower(&mut self, leader_id: Option<MemberId>) {
        let term = self.ctx.current_term();
        if let Some(leader) = self.election.take_leader_state() {
            slog::info!(self.ctx.logger, "Stepping down as leader in term {:?}", term);
            for request in leader.client_requests {
                request.callback.send(Err(SubmitError::NotLeader {
                    leader_hint: leader_id.clone(),
                }));
            }
            self.membership_on_leadership_lost();
        }
        self.election.transition_to_follower(leader_id, term);
        self.maybe_elect_self();
    }

    /// A lone voting member has nobody to hear from. It elects itself right away.
    fn maybe_elect_self(&mut self) {
        if self.ctx.peers.is_empty() && self.election.leader_id().is_none() && self.ctx.can_start_election() {
            slog::debug!(self.ctx.logger, "No peers, starting an election right away");
            self.ctx.actor_client.deliver(Event::Raft(RaftMessage::TimeoutNow));
        }
    }
}

/// What a leader does once a leadership transfer is over, whether or not it succeeded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TransferFollowUp {
    None,
    StepDown,
    Shutdown,
}
