use crate::actor::Event;
use crate::replica::election::LeaderStateTracker;
use crate::replica::log_entry::{LogEntry, Payload};
use crate::replica::messages::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, RaftMessage, INVALID_CHUNK_INDEX,
};
use crate::replica::peers::majority_vote_count;
use crate::replica::persistence::{PersistCallback, PersistContinuation, PersistenceError};
use crate::replica::replica::Replica;
use crate::replica::replicated_log::PersistMode;
use crate::replica::snapshot::Snapshot;
use crate::replica::{LeaderTimerTick, MemberId, RaftRole, Term, VotingState};
use tokio::time::Instant;

/// What `send_updates_to_follower` decided to send.
enum FollowerUpdate {
    Nothing,
    Heartbeat,
    Entries(Vec<LogEntry>),
    SnapshotChunk,
    /// Heartbeat, then start capturing a snapshot for the follower.
    HeartbeatAndInstall,
}

impl Replica {
    pub(crate) fn become_leader(&mut self) {
        let term = self.ctx.current_term();
        let commit_index = self.ctx.commit_index;

        let mut tracker = LeaderStateTracker::new();
        for peer in self.ctx.peers.iter() {
            tracker.add_follower(self.election.new_follower_log_information(
                peer.id().clone(),
                peer.voting_state(),
                commit_index,
                term,
            ));
        }
        self.election.transition_to_leader(tracker, term);
        slog::info!(
            self.ctx.logger,
            "Became leader in term {:?}, last index {}, commit index {}",
            term,
            self.ctx.log.last_index(),
            commit_index
        );

        // > Upon election: send initial empty AppendEntries RPCs
        // > (heartbeat) to each server
        self.send_append_entries_to_all(true);

        // Entries from earlier terms only commit once one from our term does.
        if commit_index < self.ctx.log.last_index() {
            if let Err(e) = self.leader_replicate(Payload::Noop) {
                slog::error!(self.ctx.logger, "Failed to append no-op entry: {}", e);
            }
        }
    }

    /// Appends `payload` to our log and starts replicating it. Returns the new entry's index.
    pub(crate) fn leader_replicate(&mut self, payload: Payload) -> Result<i64, PersistenceError> {
        let ctx = &mut self.ctx;
        let index = ctx.log.last_index() + 1;
        let term = ctx.current_term();
        let callback = PersistCallback::new(ctx.actor_client.clone(), PersistContinuation::Entry { index });

        let appended = ctx.log.append_and_persist(
            LogEntry::pending(index, term, payload),
            ctx.persistence.as_mut(),
            PersistMode::Async(callback),
        )?;
        if !appended {
            return Err(PersistenceError::Rejected(format!("Entry {} was not appended", index)));
        }
        slog::debug!(ctx.logger, "Appended entry {} in term {:?}", index, term);

        self.send_append_entries_to_all(false);
        Ok(index)
    }

    pub(crate) fn send_append_entries_to_all(&mut self, heartbeat: bool) {
        let follower_ids = match self.election.leader() {
            Some(leader) => leader.tracker.follower_ids(),
            None => return,
        };
        for id in follower_ids {
            self.send_updates_to_follower(&id, heartbeat);
        }
    }

    pub(crate) fn leader_timer(&mut self, tick: LeaderTimerTick) {
        if !self.election.role().is_leader() || tick.term != self.ctx.current_term() {
            return;
        }
        self.send_updates_to_follower(&tick.peer_id, true);

        let interval = self.ctx.options.isolated_check_interval;
        if let Some(leader) = self.election.leader_mut() {
            if leader.last_isolated_check.elapsed() >= interval {
                leader.last_isolated_check = Instant::now();
                self.ctx.actor_client.deliver(Event::IsolatedLeaderCheck);
            }
        }
    }

    /// Sends whatever the follower needs next: a snapshot chunk, missing entries or a heartbeat.
    fn send_updates_to_follower(&mut self, follower_id: &MemberId, heartbeat: bool) {
        let election_timeout = self.ctx.options.election_timeout();
        let heartbeat_duration = self.ctx.options.leader_heartbeat_duration;
        let ctx = &self.ctx;
        let follower = match self
            .election
            .leader_mut()
            .and_then(|leader| leader.tracker.follower_mut(follower_id))
        {
            Some(follower) => follower,
            None => return,
        };

        let is_active = follower.is_follower_active(election_timeout);
        let next_index = follower.next_index();
        let commit_index = ctx.commit_index;

        let update = if let Some(install) = follower.install_snapshot_state_mut() {
            if install.is_chunk_timed_out(Instant::now(), election_timeout) {
                slog::warn!(ctx.logger, "Snapshot chunk {} to {} timed out", install.chunk_index(), follower_id);
                install.mark_send_status(false);
            }
            if is_active && install.can_send_next_chunk() {
                FollowerUpdate::SnapshotChunk
            } else if heartbeat {
                FollowerUpdate::Heartbeat
            } else {
                FollowerUpdate::Nothing
            }
        } else if is_active && ctx.log.is_present(next_index) {
            let entries = ctx.log.get_from(
                next_index,
                ctx.options.max_append_entries,
                ctx.options.max_append_entries_data_size,
            );
            let sendable_commit = follower_commit_index(commit_index, true, false, next_index, entries.len());
            if follower.ok_to_replicate(sendable_commit, heartbeat_duration) {
                FollowerUpdate::Entries(entries)
            } else {
                FollowerUpdate::Nothing
            }
        } else if is_active
            && next_index >= 0
            && ctx.log.last_index() > next_index
            && !ctx.snapshot_manager.is_capturing()
        {
            FollowerUpdate::HeartbeatAndInstall
        } else if heartbeat
            || follower.has_stale_commit_index(follower_commit_index(commit_index, is_active, false, next_index, 0))
        {
            // Even an inactive follower gets heartbeats, in case it comes back.
            FollowerUpdate::Heartbeat
        } else {
            FollowerUpdate::Nothing
        };

        match update {
            FollowerUpdate::Nothing => {}
            FollowerUpdate::Heartbeat => self.send_append_entries_to_follower(follower_id, Vec::new()),
            FollowerUpdate::Entries(entries) => self.send_append_entries_to_follower(follower_id, entries),
            FollowerUpdate::SnapshotChunk => self.send_snapshot_chunk(follower_id),
            FollowerUpdate::HeartbeatAndInstall => {
                self.send_append_entries_to_follower(follower_id, Vec::new());
                if self.can_install_snapshot(next_index) {
                    slog::info!(
                        self.ctx.logger,
                        "Initiating snapshot install to {}: next index {}, snapshot index {}, last index {}",
                        follower_id,
                        next_index,
                        self.ctx.log.snapshot_index(),
                        self.ctx.log.last_index()
                    );
                    self.initiate_capture_snapshot(follower_id);
                } else {
                    slog::info!(
                        self.ctx.logger,
                        "{} is behind but cannot install a snapshot: next index {}, snapshot index {}",
                        follower_id,
                        next_index,
                        self.ctx.log.snapshot_index()
                    );
                }
            }
        }
    }

    pub(crate) fn send_append_entries_to_follower(&mut self, follower_id: &MemberId, entries: Vec<LogEntry>) {
        let election_timeout = self.ctx.options.election_timeout();
        let (next_index, is_active, installing) = match self
            .election
            .leader()
            .and_then(|leader| leader.tracker.follower(follower_id))
        {
            Some(follower) => (
                follower.next_index(),
                follower.is_follower_active(election_timeout),
                follower.install_snapshot_state().is_some(),
            ),
            None => return,
        };

        let (prev_log_index, prev_log_term) = match self.ctx.log.term_at(next_index - 1) {
            Some(term) => (next_index - 1, term),
            None => (-1, Term::NONE),
        };
        let leader_commit = follower_commit_index(
            self.ctx.commit_index,
            is_active,
            installing,
            next_index,
            entries.len(),
        );

        if !entries.is_empty() {
            slog::debug!(
                self.ctx.logger,
                "Sending {} entries from {} to {}, prev index {}, leader commit {}",
                entries.len(),
                next_index,
                follower_id,
                prev_log_index,
                leader_commit
            );
        }
        let request = AppendEntries {
            term: self.ctx.current_term(),
            leader_id: self.ctx.my_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
            replicated_to_all_index: self.ctx.replicated_to_all_index,
        };

        if let Some(follower) = self
            .election
            .leader_mut()
            .and_then(|leader| leader.tracker.follower_mut(follower_id))
        {
            follower.set_sent_commit_index(leader_commit);
            follower.reset_heartbeat_timer();
        }
        self.ctx.send(follower_id, RaftMessage::AppendEntries(request));
    }

    fn can_install_snapshot(&self, next_index: i64) -> bool {
        // Nothing in common with the follower, or the entries it needs were snapshotted away.
        next_index == -1 || (!self.ctx.log.is_present(next_index) && self.ctx.log.is_in_snapshot(next_index))
    }

    pub(crate) fn leader_handle_append_entries_reply(&mut self, reply: AppendEntriesReply) {
        if !self.election.role().is_leader() {
            slog::debug!(self.ctx.logger, "Ignoring AppendEntriesReply from {}, not leader", reply.follower_id);
            return;
        }
        let follower_id = reply.follower_id.clone();
        let follower_last_index = reply.log_last_index;
        let leader_last_index = self.ctx.log.last_index();

        let ctx = &self.ctx;
        let follower = match self
            .election
            .leader_mut()
            .and_then(|leader| leader.tracker.follower_mut(&follower_id))
        {
            Some(follower) => follower,
            None => {
                slog::warn!(ctx.logger, "AppendEntriesReply from unknown follower {}", follower_id);
                return;
            }
        };
        follower.mark_follower_active();

        let mut capture_for_install = false;
        let mut updated = false;
        if follower.install_snapshot_state().is_some() {
            // Acks to heartbeats sent during an install say nothing about the follower's log.
            slog::trace!(ctx.logger, "{} is installing a snapshot, ignoring its log position", follower_id);
        } else if follower_last_index > leader_last_index {
            // Only a non-voting follower can get ahead of us. Reset it with a snapshot.
            slog::info!(
                ctx.logger,
                "{} last index {} is ahead of ours {}, forcing a snapshot install",
                follower_id,
                follower_last_index,
                leader_last_index
            );
            follower.set_match_index(-1);
            follower.set_next_index(-1);
            capture_for_install = true;
        } else if reply.success {
            let term_in_our_log = ctx.log.term_at(follower_last_index);
            match term_in_our_log {
                Some(term) if follower_last_index >= 0 && term != reply.log_last_term => {
                    // The follower holds a conflicting last entry we never sent it in this round.
                    follower.set_next_index(follower_last_index - 1);
                    updated = true;
                    slog::info!(
                        ctx.logger,
                        "{} last entry {} has term {:?}, ours is {:?}, next index now {}",
                        follower_id,
                        follower_last_index,
                        reply.log_last_term,
                        term,
                        follower.next_index()
                    );
                }
                _ => {
                    updated = follower.set_match_index(follower_last_index);
                    updated = follower.set_next_index(follower_last_index + 1) || updated;
                }
            }
        } else {
            slog::info!(
                ctx.logger,
                "Unsuccessful AppendEntriesReply from {}: last index {} term {:?}",
                follower_id,
                follower_last_index,
                reply.log_last_term
            );
            let term_in_our_log = ctx.log.term_at(follower_last_index);
            if reply.force_install_snapshot {
                follower.set_match_index(-1);
                follower.set_next_index(-1);
                capture_for_install = true;
            } else if follower_last_index < 0 || term_in_our_log == Some(reply.log_last_term) {
                // Just behind, catch up from its last entry.
                updated = follower.set_match_index(follower_last_index);
                updated = follower.set_next_index(follower_last_index + 1) || updated;
            } else if follower.decr_next_index(follower_last_index) {
                updated = true;
                slog::info!(
                    ctx.logger,
                    "{} conflicts at {}, next index now {}",
                    follower_id,
                    follower_last_index,
                    follower.next_index()
                );
            }
        }
        if updated {
            slog::debug!(
                ctx.logger,
                "{} now at match index {}, next index {}",
                follower_id,
                follower.match_index(),
                follower.next_index()
            );
        }

        if capture_for_install {
            self.initiate_capture_snapshot(&follower_id);
        }

        if self.election.role() == RaftRole::IsolatedLeader && !self.is_isolated() {
            slog::info!(self.ctx.logger, "Voting majority reachable again, no longer isolated");
            self.election.set_leader_isolated(false, self.ctx.current_term());
        }

        self.leader_commit_and_apply();

        // Send what's next right away rather than on the next heartbeat.
        self.send_updates_to_follower(&follower_id, false);
        self.transfer_on_follower_progress(&follower_id);
    }

    /// Advances the commit index as far as a voting majority holds entries of our term, then
    /// applies and trims.
    pub(crate) fn leader_commit_and_apply(&mut self) {
        let min_replication_count = majority_vote_count(self.ctx.peers.voting_peer_count());
        let self_count = if self.ctx.peers.is_voting_member() { 1 } else { 0 };
        let current_term = self.ctx.current_term();

        let leader = match self.election.leader() {
            Some(leader) => leader,
            None => return,
        };
        let ctx = &mut self.ctx;
        let mut index = ctx.commit_index + 1;
        while let Some(entry) = ctx.log.get(index) {
            // Our own copy counts once it's durable.
            if entry.is_persistence_pending() {
                slog::trace!(ctx.logger, "Entry {} still persisting", index);
                break;
            }
            if self_count == 0 && min_replication_count == 0 {
                break;
            }
            let replicated_count = self_count + leader.tracker.voting_replicated_count(index);
            if replicated_count < min_replication_count {
                break;
            }

            // > If there exists an N such that N > commitIndex, a majority
            // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
            // > set commitIndex = N (§5.3, §5.4).
            if entry.term == current_term {
                ctx.commit_index = index;
            } else {
                slog::debug!(ctx.logger, "Not committing {} from earlier term {:?}", index, entry.term);
            }
            index += 1;
        }

        if self.ctx.commit_index > self.ctx.last_applied {
            self.apply_log_to_state_machine(self.ctx.commit_index);
        }
        if !self.ctx.snapshot_manager.is_capturing() {
            self.purge_in_memory_log();
        }
    }

    /// Trims entries every follower holds. Without followers everything applied may go.
    fn purge_in_memory_log(&mut self) {
        let min_replicated = match self.election.leader().and_then(|l| l.tracker.min_match_index()) {
            Some(index) => index,
            None => self.ctx.last_applied,
        };
        self.trim_to_replicated_to_all(min_replicated);
    }

    fn is_isolated(&self) -> bool {
        let min_isolated_peer_count = majority_vote_count(self.ctx.peers.voting_peer_count()).saturating_sub(1);
        match self.election.leader() {
            Some(leader) => leader
                .tracker
                .is_isolated(min_isolated_peer_count, self.ctx.options.election_timeout()),
            None => false,
        }
    }

    /// Switches between Leader and IsolatedLeader depending on how many voting followers answer.
    pub(crate) fn isolated_leader_check(&mut self) {
        match self.election.leader_mut() {
            Some(leader) => leader.last_isolated_check = Instant::now(),
            None => return,
        }

        let isolated = self.is_isolated();
        let role = self.election.role();
        if isolated && role == RaftRole::Leader {
            slog::warn!(
                self.ctx.logger,
                "Lost contact with a voting majority, becoming isolated leader in term {:?}",
                self.ctx.current_term()
            );
            self.election.set_leader_isolated(true, self.ctx.current_term());
        } else if !isolated && role == RaftRole::IsolatedLeader {
            slog::info!(self.ctx.logger, "Voting majority reachable again, no longer isolated");
            self.election.set_leader_isolated(false, self.ctx.current_term());
        }
    }

    /// Starts streaming a snapshot to the follower, capturing one first if none is at hand.
    /// Returns true if the install is under way.
    pub(crate) fn initiate_capture_snapshot(&mut self, follower_id: &MemberId) -> bool {
        let has_snapshot = match self.election.leader() {
            Some(leader) => leader.snapshot_holder.is_some(),
            None => return false,
        };
        if has_snapshot {
            self.send_snapshot_chunk(follower_id);
            return true;
        }

        if !self.start_capture(false, Some(follower_id.clone())) {
            return false;
        }
        let chunk_size = self.ctx.options.snapshot_chunk_size;
        if let Some(follower) = self
            .election
            .leader_mut()
            .and_then(|leader| leader.tracker.follower_mut(follower_id))
        {
            follower.init_install_snapshot_state(chunk_size);
        }
        true
    }

    /// A snapshot captured for installation is ready. Sends it to everyone waiting for one.
    pub(crate) fn leader_install_captured_snapshot(&mut self, snapshot: Snapshot) {
        let ctx = &self.ctx;
        let leader = match self.election.leader_mut() {
            Some(leader) => leader,
            None => return,
        };
        slog::info!(
            ctx.logger,
            "Snapshot for install captured: last applied {} term {:?}, {} bytes",
            snapshot.last_applied_index,
            snapshot.last_applied_term,
            snapshot.state.len()
        );
        leader.snapshot_holder = Some(snapshot);

        let mut targets = Vec::new();
        for follower in leader.tracker.followers() {
            let next_index = follower.next_index();
            if follower.install_snapshot_state().is_some()
                || follower.voting_state() == VotingState::VotingNotInitialized
                || next_index == -1
                || (!ctx.log.is_present(next_index) && ctx.log.is_in_snapshot(next_index))
            {
                targets.push(follower.id().clone());
            }
        }
        targets.sort();
        for id in targets {
            self.send_snapshot_chunk(&id);
        }
    }

    fn send_snapshot_chunk(&mut self, follower_id: &MemberId) {
        let chunk_size = self.ctx.options.snapshot_chunk_size;
        let leader = match self.election.leader_mut() {
            Some(leader) => leader,
            None => return,
        };
        let snapshot = match &leader.snapshot_holder {
            Some(snapshot) => snapshot,
            None => return,
        };
        let follower = match leader.tracker.follower_mut(follower_id) {
            Some(follower) => follower,
            None => return,
        };

        let install = follower.init_install_snapshot_state(chunk_size);
        install.set_snapshot_bytes(snapshot.state.clone());
        let chunk = match install.next_chunk(Instant::now()) {
            Some(chunk) => chunk,
            None => return,
        };
        follower.reset_heartbeat_timer();

        slog::debug!(
            self.ctx.logger,
            "Sending snapshot chunk {}/{} to {}",
            chunk.chunk_index,
            chunk.total_chunks,
            follower_id
        );
        let server_config = if chunk.is_last() {
            self.ctx.peers.dynamic_server_config()
        } else {
            None
        };
        let request = InstallSnapshot {
            term: self.ctx.current_term(),
            leader_id: self.ctx.my_id.clone(),
            last_included_index: snapshot.last_applied_index,
            last_included_term: snapshot.last_applied_term,
            data: chunk.data,
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            last_chunk_hash: chunk.last_chunk_hash,
            server_config,
        };
        self.ctx.send(follower_id, RaftMessage::InstallSnapshot(request));
    }

    pub(crate) fn leader_handle_install_snapshot_reply(&mut self, reply: InstallSnapshotReply) {
        if !self.election.role().is_leader() {
            return;
        }
        let follower_id = reply.follower_id.clone();
        let ctx = &self.ctx;
        let leader = match self.election.leader_mut() {
            Some(leader) => leader,
            None => return,
        };
        let snapshot_index = leader.snapshot_holder.as_ref().map(|s| s.last_applied_index);
        let follower = match leader.tracker.follower_mut(&follower_id) {
            Some(follower) => follower,
            None => {
                slog::warn!(ctx.logger, "InstallSnapshotReply from unknown follower {}", follower_id);
                return;
            }
        };
        follower.mark_follower_active();
        let voting_state = follower.voting_state();

        let install = match follower.install_snapshot_state_mut() {
            Some(install) => install,
            None => {
                slog::warn!(ctx.logger, "InstallSnapshotReply from {} without an install in progress", follower_id);
                return;
            }
        };

        if install.chunk_index() != reply.chunk_index {
            slog::warn!(
                ctx.logger,
                "InstallSnapshotReply from {} for chunk {}, expected {}",
                follower_id,
                reply.chunk_index,
                install.chunk_index()
            );
            if reply.chunk_index == INVALID_CHUNK_INDEX {
                install.reset();
            }
            return;
        }

        if !reply.success {
            slog::warn!(ctx.logger, "{} failed to take snapshot chunk {}", follower_id, reply.chunk_index);
            install.mark_send_status(false);
            return;
        }

        if !install.is_last_chunk(reply.chunk_index) {
            install.mark_send_status(true);
            self.send_snapshot_chunk(&follower_id);
            return;
        }

        let snapshot_index = match snapshot_index {
            Some(index) => index,
            None => return,
        };
        follower.set_match_index(snapshot_index);
        follower.set_next_index(snapshot_index + 1);
        follower.clear_install_snapshot_state();
        slog::info!(
            ctx.logger,
            "Snapshot installed on {}, match index {}",
            follower_id,
            snapshot_index
        );

        if !leader.tracker.any_installing_snapshot() {
            leader.snapshot_holder = None;
        }

        if voting_state == VotingState::VotingNotInitialized {
            self.membership_on_uninitialized_follower_snapshot_reply(&follower_id);
        }
        self.leader_commit_and_apply();
        self.send_updates_to_follower(&follower_id, false);
        self.transfer_on_follower_progress(&follower_id);
    }

    /// Brings the follower tracking in line with the peer list after a configuration change.
    pub(crate) fn leader_sync_followers_with_peers(&mut self) {
        let term = self.ctx.current_term();
        let commit_index = self.ctx.commit_index;

        let tracked = match self.election.leader() {
            Some(leader) => leader.tracker.follower_ids(),
            None => return,
        };
        let mut added = Vec::new();
        for peer in self.ctx.peers.iter() {
            if !tracked.contains(peer.id()) {
                added.push(self.election.new_follower_log_information(
                    peer.id().clone(),
                    peer.voting_state(),
                    commit_index,
                    term,
                ));
            }
        }

        let peers = &self.ctx.peers;
        let logger = &self.ctx.logger;
        let leader = match self.election.leader_mut() {
            Some(leader) => leader,
            None => return,
        };
        for id in tracked {
            match peers.get(&id) {
                Some(peer) => {
                    if let Some(follower) = leader.tracker.follower_mut(&id) {
                        follower.set_voting_state(peer.voting_state());
                    }
                }
                None => {
                    slog::info!(logger, "No longer tracking removed follower {}", id);
                    leader.tracker.remove_follower(&id);
                }
            }
        }
        for follower in added {
            slog::info!(logger, "Tracking new follower {} ({:?})", follower.id(), follower.voting_state());
            leader.tracker.add_follower(follower);
        }
        if leader.tracker.followers().all(|f| f.install_snapshot_state().is_none()) {
            leader.snapshot_holder = None;
        }
    }
}

/// Commit index a follower may learn from an AppendEntries carrying `entry_count` entries after
/// `next_index - 1`. Never past what the follower is known to hold.
fn follower_commit_index(
    commit_index: i64,
    is_active: bool,
    installing: bool,
    next_index: i64,
    entry_count: usize,
) -> i64 {
    if installing || !is_active {
        return -1;
    }
    commit_index.min(next_index - 1 + entry_count as i64).max(-1)
}

#[cfg(test)]
mod tests {
    use crate::replica::log_entry::{LogEntry, Payload};
    use crate::replica::messages::{AppendEntries, AppendEntriesReply, RaftMessage};
    use crate::replica::test_harness::TestCluster;
    use crate::replica::{MemberId, RaftRole, Term};
    use bytes::Bytes;
    use tokio::time::Duration;

    #[tokio::test]
    async fn new_leader_commits_earlier_entries_through_a_noop() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;

        // Only b gets the entry, and never hears that it committed.
        cluster.transport.isolate(&MemberId::new("a"));
        cluster.deliver(
            "b",
            RaftMessage::AppendEntries(AppendEntries {
                term: Term::new(1),
                leader_id: MemberId::new("a"),
                prev_log_index: -1,
                prev_log_term: Term::NONE,
                entries: vec![LogEntry::new(0, Term::new(1), Payload::Command(Bytes::from("first")))],
                leader_commit: -1,
                replicated_to_all_index: -1,
            }),
        );
        cluster.settle().await;

        cluster.trigger_election("b");
        cluster.settle().await;
        cluster.heartbeat("b");
        cluster.settle().await;

        let b = cluster.state("b");
        assert_eq!(b.role, RaftRole::Leader);
        assert_eq!(b.term, Term::new(2));
        assert_eq!(b.last_index, 1);
        assert_eq!(b.commit_index, 1);
        assert_eq!(cluster.applied_indexes("c"), vec![0]);
    }

    #[tokio::test]
    async fn lagging_follower_gets_a_snapshot() {
        let mut cluster = TestCluster::with_options(&["a", "b", "c"], |options| options.snapshot_chunk_size = 8);
        cluster.start();
        cluster.elect("a").await;

        cluster.transport.isolate(&MemberId::new("c"));
        for i in 0..5 {
            cluster.submit("a", format!("cmd-{}", i)).await.unwrap();
        }
        cluster.heartbeat("a");
        cluster.settle().await;
        cluster.replica_mut("a").capture_snapshot().unwrap();
        cluster.settle().await;
        assert_eq!(cluster.state("a").snapshot_index, 4);

        cluster.transport.heal(&MemberId::new("c"));
        for _ in 0..3 {
            cluster.heartbeat("a");
            cluster.settle().await;
        }

        let c = cluster.state("c");
        assert_eq!(c.snapshot_index, 4);
        assert_eq!(c.commit_index, 4);
        assert_eq!(c.last_applied, 4);
        assert_eq!(cluster.applied_indexes("c"), vec![0, 1, 2, 3, 4]);

        let follower = cluster
            .state("a")
            .followers
            .into_iter()
            .find(|f| f.id == MemberId::new("c"))
            .unwrap();
        assert_eq!(follower.match_index, 4);
        assert_eq!(follower.next_index, 5);

        // Replication carries on normally afterwards.
        cluster.submit("a", "after").await.unwrap();
        cluster.heartbeat("a");
        cluster.settle().await;
        assert_eq!(cluster.applied_indexes("c"), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn leader_without_majority_becomes_isolated_and_recovers() {
        let mut cluster = TestCluster::with_options(&["a", "b", "c"], |options| {
            options.follower_min_timeout = Duration::from_millis(20);
            options.follower_max_timeout = Duration::from_millis(40);
        });
        cluster.start();
        cluster.elect("a").await;

        cluster.transport.isolate(&MemberId::new("a"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cluster.replica_mut("a").isolated_leader_check();
        assert_eq!(cluster.state("a").role, RaftRole::IsolatedLeader);

        // Writes are accepted but cannot commit.
        cluster.submit_no_wait("a", "pending");
        cluster.settle().await;
        assert_eq!(cluster.state("a").commit_index, -1);

        cluster.transport.heal(&MemberId::new("a"));
        cluster.heartbeat("a");
        cluster.settle().await;
        let a = cluster.state("a");
        assert_eq!(a.role, RaftRole::Leader);
        assert_eq!(a.commit_index, 0);
    }

    #[tokio::test]
    async fn reply_from_a_follower_ahead_of_the_leader_forces_a_snapshot() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.submit("a", "x").await.unwrap();

        cluster.deliver(
            "a",
            RaftMessage::AppendEntriesReply(AppendEntriesReply {
                follower_id: MemberId::new("c"),
                term: Term::new(1),
                success: true,
                log_last_index: 7,
                log_last_term: Term::new(1),
                force_install_snapshot: false,
            }),
        );
        cluster.settle().await;
        cluster.heartbeat("a");
        cluster.settle().await;

        let follower = cluster
            .state("a")
            .followers
            .into_iter()
            .find(|f| f.id == MemberId::new("c"))
            .unwrap();
        assert_eq!(follower.match_index, 0);
        assert_eq!(cluster.state("c").snapshot_index, 0);
    }
}
