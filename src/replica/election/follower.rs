use crate::replica::install_snapshot::SnapshotTracker;
use crate::replica::log_entry::{LogEntry, Payload};
use crate::replica::messages::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, RaftMessage, FIRST_CHUNK_INDEX,
    INVALID_CHUNK_INDEX,
};
use crate::replica::persistence::SnapshotCallback;
use crate::replica::replica::Replica;
use crate::replica::replicated_log::PersistMode;
use crate::replica::snapshot::{ApplySnapshot, InstallSnapshotReplyTarget, Snapshot, SnapshotManager};
use crate::replica::{MemberId, Term};

impl Replica {
    /// `timeout_now` skips the check for recent leader contact. A leader handing over leadership
    /// asked for it.
    pub(crate) fn follower_handle_election_timeout(&mut self, timeout_now: bool) {
        let min_timeout = self.ctx.options.follower_min_timeout;
        let no_leader_message = self
            .election
            .follower_mut()
            .map_or(true, |f| f.no_leader_message_within(min_timeout));

        if self.ctx.can_start_election() {
            if timeout_now || no_leader_message {
                slog::info!(
                    self.ctx.logger,
                    "Election timeout{}, becoming candidate",
                    if timeout_now { " requested by leader" } else { "" }
                );
                self.become_candidate();
            } else {
                slog::debug!(self.ctx.logger, "Heard from a leader within the election timeout, not electing");
            }
        } else if !timeout_now && no_leader_message {
            // We can't elect, but the leader we knew is gone.
            self.election.set_leader_if_follower(None, self.ctx.current_term());
        }
    }

    pub(crate) fn follower_handle_append_entries(&mut self, request: AppendEntries) {
        let term = self.ctx.current_term();
        self.election.set_leader_if_follower(Some(request.leader_id.clone()), term);
        let snapshot_in_progress = match self.election.follower_mut() {
            Some(follower) => {
                follower.restart_last_leader_message_timer();
                follower.has_snapshot_tracker()
            }
            None => false,
        };

        // The leader keeps heartbeating while it streams a snapshot to us.
        if snapshot_in_progress || self.ctx.snapshot_manager.is_applying() {
            slog::trace!(self.ctx.logger, "Snapshot install in progress, acking AppendEntries");
            self.reply_append_entries(&request.leader_id, true, false);
            return;
        }

        if self.is_out_of_sync(&request) {
            self.reply_append_entries(&request.leader_id, false, false);
            return;
        }

        let leader_id = request.leader_id.clone();
        if !request.entries.is_empty() && !self.append_leader_entries(&leader_id, request.entries) {
            return;
        }

        // > If leaderCommit > commitIndex, set commitIndex =
        // > min(leaderCommit, index of last new entry)
        let last_index = self.ctx.log.last_index();
        let new_commit = request.leader_commit.min(last_index);
        if new_commit > self.ctx.commit_index {
            slog::trace!(self.ctx.logger, "Commit index moved to {}", new_commit);
            self.ctx.commit_index = new_commit;
        }
        if request.leader_commit > self.ctx.last_applied && self.ctx.last_applied < last_index {
            self.apply_log_to_state_machine(self.ctx.commit_index);
        }

        self.reply_append_entries(&leader_id, true, false);

        if !self.ctx.snapshot_manager.is_capturing() {
            self.trim_to_replicated_to_all(request.replicated_to_all_index);
        }
    }

    /// Appends what we don't have yet, dropping a conflicting suffix first. False if a reply was
    /// already sent and nothing else must happen.
    fn append_leader_entries(&mut self, leader_id: &MemberId, entries: Vec<LogEntry>) -> bool {
        let mut skip = 0;
        if self.ctx.log.size() > 0 || self.ctx.log.snapshot_index() > -1 {
            for entry in &entries {
                let ctx = &mut self.ctx;
                if !ctx.log.is_present(entry.index) && !ctx.log.is_in_snapshot(entry.index) {
                    break;
                }
                // Inside the snapshot we can't tell, assume it matches.
                match ctx.log.get(entry.index).map(|e| e.term) {
                    None => {
                        skip += 1;
                        continue;
                    }
                    Some(existing_term) if existing_term == entry.term => {
                        skip += 1;
                        continue;
                    }
                    Some(existing_term) => {
                        // > If an existing entry conflicts with a new one (same index
                        // > but different terms), delete the existing entry and all that
                        // > follow it (§5.3)
                        slog::info!(
                            ctx.logger,
                            "Removing entries from {}: term {:?} conflicts with leader's {:?}",
                            entry.index,
                            existing_term,
                            entry.term
                        );
                        match ctx.log.remove_from_and_persist(entry.index, ctx.persistence.as_mut()) {
                            Ok(true) => break,
                            Ok(false) => {
                                slog::info!(
                                    ctx.logger,
                                    "Conflicting entry {} is in our snapshot, asking for a snapshot install",
                                    entry.index
                                );
                                self.reply_append_entries(leader_id, false, true);
                                return false;
                            }
                            Err(e) => {
                                slog::error!(ctx.logger, "Failed to remove conflicting entries: {}", e);
                                self.reply_append_entries(leader_id, false, false);
                                return false;
                            }
                        }
                    }
                }
            }
        }

        // > Append any new entries not already in the log
        // Our success reply counts toward the leader's majority, so every entry is durable before
        // we answer.
        for entry in entries.into_iter().skip(skip) {
            let ctx = &mut self.ctx;
            let index = entry.index;
            let config = match &entry.payload {
                Payload::ServerConfig(config) => Some(config.clone()),
                _ => None,
            };
            match ctx
                .log
                .append_and_persist(entry, ctx.persistence.as_mut(), PersistMode::Sync)
            {
                Ok(true) => {
                    if let Some(config) = config {
                        ctx.peers.update_from_config(&config);
                    }
                    self.capture_snapshot_if_ready(index);
                }
                Ok(false) => slog::warn!(ctx.logger, "Entry {} from leader not appended", index),
                Err(e) => {
                    slog::error!(ctx.logger, "Failed to persist entry {} from leader: {}", index, e);
                    self.reply_append_entries(leader_id, false, false);
                    return false;
                }
            }
        }
        true
    }

    fn is_out_of_sync(&self, request: &AppendEntries) -> bool {
        let log = &self.ctx.log;
        let last_index = log.last_index();
        let prev_index = request.prev_log_index;
        let present_or_snapshotted = |index: i64| log.is_present(index) || log.is_in_snapshot(index);

        let reason = if last_index == -1 && prev_index != -1 {
            Some("our log is empty")
        } else if last_index > -1 && prev_index != -1 && !present_or_snapshotted(prev_index) {
            Some("previous entry is missing")
        } else if prev_index != -1
            && log
                .term_at(prev_index)
                .map_or(false, |term| term != request.prev_log_term)
        {
            // > Reply false if log doesn’t contain an entry at prevLogIndex
            // > whose term matches prevLogTerm (§5.3)
            Some("previous entry's term differs")
        } else if prev_index == -1
            && request.prev_log_term == Term::NONE
            && request.replicated_to_all_index != -1
            && !present_or_snapshotted(request.replicated_to_all_index)
        {
            Some("leader's replicated to all entry is missing")
        } else if prev_index == -1
            && request.prev_log_term == Term::NONE
            && request.replicated_to_all_index != -1
            && request
                .entries
                .first()
                .map_or(false, |e| !present_or_snapshotted(e.index - 1))
        {
            Some("entry before the first new one is missing")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                slog::info!(
                    self.ctx.logger,
                    "Out of sync with leader, {}: prev index {} term {:?}, our last index {} term {:?}",
                    reason,
                    prev_index,
                    request.prev_log_term,
                    last_index,
                    log.last_term()
                );
                true
            }
            None => false,
        }
    }

    fn reply_append_entries(&self, leader_id: &MemberId, success: bool, force_install_snapshot: bool) {
        self.ctx.send(
            leader_id,
            RaftMessage::AppendEntriesReply(AppendEntriesReply {
                follower_id: self.ctx.my_id.clone(),
                term: self.ctx.current_term(),
                success,
                log_last_index: self.ctx.log.last_index(),
                log_last_term: self.ctx.log.last_term(),
                force_install_snapshot,
            }),
        );
    }

    /// Trims without capturing up to an index every member has. If nothing could be trimmed our
    /// replicated-to-all index may still move forward.
    pub(crate) fn trim_to_replicated_to_all(&mut self, desired_index: i64) {
        let ctx = &mut self.ctx;
        let trimmed = ctx
            .snapshot_manager
            .trim_log(desired_index, ctx.last_applied, &mut ctx.log);
        if trimmed != -1 {
            ctx.replicated_to_all_index = trimmed;
        } else {
            let candidate = SnapshotManager::trim_candidate(desired_index, ctx.last_applied);
            if candidate > ctx.replicated_to_all_index {
                ctx.replicated_to_all_index = candidate;
            }
        }
    }

    pub(crate) fn follower_handle_install_snapshot(&mut self, request: InstallSnapshot) {
        let term = self.ctx.current_term();
        self.election.set_leader_if_follower(Some(request.leader_id.clone()), term);
        let follower = match self.election.follower_mut() {
            Some(follower) => follower,
            None => return,
        };
        follower.restart_last_leader_message_timer();

        let tracker_slot = follower.snapshot_tracker_mut();
        // Chunks from another leader never extend a partial snapshot.
        let from_other_leader = tracker_slot
            .as_ref()
            .map_or(true, |tracker| tracker.leader_id() != &request.leader_id);
        if request.chunk_index == FIRST_CHUNK_INDEX || from_other_leader {
            *tracker_slot = Some(SnapshotTracker::new(request.leader_id.clone(), request.total_chunks));
        }
        let added = match tracker_slot.as_mut() {
            Some(tracker) => tracker.add_chunk(request.chunk_index, &request.data, request.last_chunk_hash),
            None => return,
        };

        match added {
            Ok(false) => {
                slog::debug!(
                    self.ctx.logger,
                    "Received snapshot chunk {}/{}",
                    request.chunk_index,
                    request.total_chunks
                );
                self.reply_install_snapshot(&request.leader_id, request.chunk_index, true);
            }
            Ok(true) => {
                let state = match tracker_slot.take() {
                    Some(tracker) => tracker.into_snapshot_bytes(),
                    None => return,
                };
                slog::info!(
                    self.ctx.logger,
                    "Received all {} snapshot chunks, last included index {}",
                    request.total_chunks,
                    request.last_included_index
                );

                let snapshot = Snapshot {
                    state,
                    unapplied_entries: Vec::new(),
                    last_index: request.last_included_index,
                    last_term: request.last_included_term,
                    last_applied_index: request.last_included_index,
                    last_applied_term: request.last_included_term,
                    term_info: self.ctx.term_info(),
                    server_config: request.server_config,
                };
                let apply = ApplySnapshot {
                    snapshot,
                    reply: Some(InstallSnapshotReplyTarget {
                        leader_id: request.leader_id.clone(),
                        chunk_index: request.chunk_index,
                    }),
                };

                let ctx = &mut self.ctx;
                let callback = SnapshotCallback::new(ctx.actor_client.clone());
                if ctx
                    .snapshot_manager
                    .apply_from_leader(apply, ctx.persistence.as_mut(), callback)
                    .is_err()
                {
                    self.reply_install_snapshot(&request.leader_id, INVALID_CHUNK_INDEX, false);
                }
                // Otherwise the reply goes out once the snapshot is durable.
            }
            Err(e) => {
                slog::warn!(self.ctx.logger, "Rejecting snapshot chunk {}: {}", request.chunk_index, e);
                *tracker_slot = None;
                self.reply_install_snapshot(&request.leader_id, INVALID_CHUNK_INDEX, false);
            }
        }
    }

    fn reply_install_snapshot(&self, leader_id: &MemberId, chunk_index: i32, success: bool) {
        self.ctx.send(
            leader_id,
            RaftMessage::InstallSnapshotReply(InstallSnapshotReply {
                term: self.ctx.current_term(),
                follower_id: self.ctx.my_id.clone(),
                chunk_index,
                success,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::replica::install_snapshot::chunk_hash;
    use crate::replica::messages::{AppendEntries, InstallSnapshot, RaftMessage};
    use crate::replica::test_harness::TestCluster;
    use crate::replica::{LogEntry, MemberId, Payload, RaftRole, Term};
    use bytes::Bytes;

    fn entry(index: i64, term: i64) -> LogEntry {
        LogEntry::new(index, Term::new(term), Payload::Command(Bytes::from(format!("e{}", index))))
    }

    fn append_entries(prev_index: i64, prev_term: i64, entries: Vec<LogEntry>, commit: i64) -> RaftMessage {
        RaftMessage::AppendEntries(AppendEntries {
            term: Term::new(1),
            leader_id: MemberId::new("leader"),
            prev_log_index: prev_index,
            prev_log_term: if prev_term < 0 { Term::NONE } else { Term::new(prev_term) },
            entries,
            leader_commit: commit,
            replicated_to_all_index: -1,
        })
    }

    #[tokio::test]
    async fn appends_and_commits_up_to_leader_commit() {
        let mut cluster = TestCluster::with_options(&["f", "leader"], |o| o.elections_enabled = false);
        cluster.start();

        cluster.deliver("f", append_entries(-1, -1, vec![entry(0, 1), entry(1, 1), entry(2, 1)], 1));
        cluster.settle().await;

        let state = cluster.state("f");
        assert_eq!(state.term, Term::new(1));
        assert_eq!(state.leader_id, Some(MemberId::new("leader")));
        assert_eq!(state.last_index, 2);
        assert_eq!(state.commit_index, 1);
        assert_eq!(cluster.applied_indexes("f"), vec![0, 1]);
    }

    #[tokio::test]
    async fn rejects_when_previous_entry_is_missing() {
        let mut cluster = TestCluster::with_options(&["f", "leader"], |o| o.elections_enabled = false);
        cluster.start();

        cluster.deliver("f", append_entries(-1, -1, vec![entry(0, 1)], -1));
        cluster.deliver("f", append_entries(4, 1, vec![entry(5, 1)], -1));
        cluster.settle().await;

        let replies = cluster.sent_append_entries_replies("f");
        assert_eq!(replies.len(), 2);
        assert!(replies[0].success);
        assert!(!replies[1].success);
        assert_eq!(replies[1].log_last_index, 0);
        assert_eq!(cluster.state("f").last_index, 0);
    }

    #[tokio::test]
    async fn non_voting_follower_never_starts_an_election() {
        let mut cluster = TestCluster::new(&["a", "b"]);
        cluster.start();
        cluster.replica_mut("a").ctx.peers.set_voting_member(false);

        cluster.trigger_election("a");
        cluster.settle().await;
        assert_eq!(cluster.state("a").role, RaftRole::Follower);
        assert_eq!(cluster.state("a").term, Term::new(0));
    }

    fn snapshot_chunk(leader: &str, data: &'static str, chunk_index: i32, total_chunks: i32, hash: Option<u64>) -> RaftMessage {
        RaftMessage::InstallSnapshot(InstallSnapshot {
            term: Term::new(1),
            leader_id: MemberId::new(leader),
            last_included_index: 4,
            last_included_term: Term::new(1),
            data: Bytes::from_static(data.as_bytes()),
            chunk_index,
            total_chunks,
            last_chunk_hash: hash,
            server_config: None,
        })
    }

    #[tokio::test]
    async fn snapshot_chunks_from_another_leader_are_not_combined() {
        let mut cluster = TestCluster::with_options(&["f", "l1", "l2"], |o| o.elections_enabled = false);
        cluster.start();

        cluster.deliver("f", snapshot_chunk("l1", "3=x,", 1, 2, None));
        cluster.deliver("f", snapshot_chunk("l2", "4=y", 2, 2, Some(chunk_hash(b"3=x,"))));
        cluster.settle().await;

        let state = cluster.state("f");
        assert_eq!(state.snapshot_index, -1);
        assert_eq!(state.last_applied, -1);

        cluster.deliver("f", snapshot_chunk("l2", "3=x,4=y", 1, 1, None));
        cluster.settle().await;

        let state = cluster.state("f");
        assert_eq!(state.snapshot_index, 4);
        assert_eq!(state.last_applied, 4);
    }
}
