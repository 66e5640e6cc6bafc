use crate::replica::log_entry::LogEntry;
use crate::replica::peers::{MemberId, ServerConfigurationPayload};
use crate::replica::persistence::{DataPersistenceProvider, SnapshotCallback, SnapshotMetadata};
use crate::replica::replicated_log::ReplicatedLog;
use crate::replica::term_info::{Term, TermInfo};
use bytes::Bytes;

/// Point in time capture of the state machine plus the log coordinates it corresponds to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    pub state: Bytes,
    pub unapplied_entries: Vec<LogEntry>,
    pub last_index: i64,
    pub last_term: Term,
    pub last_applied_index: i64,
    pub last_applied_term: Term,
    pub term_info: TermInfo,
    pub server_config: Option<ServerConfigurationPayload>,
}

/// Log coordinates frozen when a capture starts. The state arrives later from the state machine.
#[derive(Clone, Debug)]
pub(crate) struct CaptureSnapshot {
    last_index: i64,
    last_term: Term,
    last_applied_index: i64,
    last_applied_term: Term,
    replicated_to_all_index: i64,
    replicated_to_all_term: Term,
    unapplied_entries: Vec<LogEntry>,
    mandatory_trim: bool,
    install_target: Option<MemberId>,
}

/// A snapshot received from the leader, waiting to become durable before it replaces our state.
#[derive(Debug)]
pub(crate) struct ApplySnapshot {
    pub(crate) snapshot: Snapshot,
    pub(crate) reply: Option<InstallSnapshotReplyTarget>,
}

/// Where to report the outcome of applying a leader's snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InstallSnapshotReplyTarget {
    pub(crate) leader_id: MemberId,
    pub(crate) chunk_index: i32,
}

enum State {
    Idle,
    Capturing(CaptureSnapshot),
    PersistingCapture,
    PersistingApply(ApplySnapshot),
}

/// Inputs to a capture that come from the replica rather than the log.
pub(crate) struct CaptureRequest<'a> {
    pub(crate) last_entry: Option<&'a LogEntry>,
    pub(crate) replicated_to_all_index: i64,
    pub(crate) last_applied: i64,
    pub(crate) mandatory_trim: bool,
    pub(crate) install_target: Option<MemberId>,
}

/// Trim thresholds, copied from the replica options.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SnapshotThresholds {
    pub(crate) batch_count: u64,
    pub(crate) data_threshold: usize,
}

/// What the caller must do after the captured state was handed to persistence.
#[derive(Debug, Default)]
pub(crate) struct PersistOutcome {
    /// New replicated-to-all index for the current behavior.
    pub(crate) replicated_to_all_index: Option<i64>,
    /// Snapshot to stream to followers that asked for an install.
    pub(crate) install: Option<Snapshot>,
}

#[derive(Debug)]
pub(crate) enum CommitOutcome {
    /// A captured snapshot is durable and the log trim is final.
    Captured,
    /// A leader's snapshot is durable. The caller must now install it.
    Applied(ApplySnapshot),
}

/// SnapshotManager runs at most one snapshot at a time through
/// `Idle -> Capturing -> PersistingCapture -> Idle` or `Idle -> PersistingApply -> Idle`.
pub(crate) struct SnapshotManager {
    state: State,
    last_sequence_number: u64,
    logger: slog::Logger,
}

impl SnapshotManager {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        SnapshotManager {
            state: State::Idle,
            last_sequence_number: 0,
            logger,
        }
    }

    pub(crate) fn is_capturing(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    pub(crate) fn is_applying(&self) -> bool {
        matches!(self.state, State::PersistingApply(_))
    }

    /// Starts a capture. Returns false if another snapshot is in progress. On true the caller must
    /// obtain the state machine's state and feed it to `persist`.
    pub(crate) fn capture(
        &mut self,
        request: CaptureRequest<'_>,
        log: &ReplicatedLog,
        persistence: &dyn DataPersistenceProvider,
    ) -> bool {
        if self.is_capturing() {
            slog::debug!(self.logger, "Snapshot already in progress, not capturing");
            return false;
        }

        let (last_applied_index, last_applied_term) = if let Some(entry) = log.get(request.last_applied) {
            (entry.index, entry.term)
        } else if log.snapshot_index() > -1 {
            (log.snapshot_index(), log.snapshot_term())
        } else {
            (-1, Term::NONE)
        };

        let (replicated_to_all_index, replicated_to_all_term) = match log.get(request.replicated_to_all_index) {
            Some(entry) => (entry.index, entry.term),
            None => (-1, Term::NONE),
        };

        let (last_index, last_term) = match request.last_entry {
            Some(entry) => (entry.index, entry.term),
            None => (last_applied_index, last_applied_term),
        };

        let capture = CaptureSnapshot {
            last_index,
            last_term,
            last_applied_index,
            last_applied_term,
            replicated_to_all_index,
            replicated_to_all_term,
            unapplied_entries: log.get_from(last_applied_index + 1, usize::MAX, usize::MAX),
            mandatory_trim: request.mandatory_trim,
            install_target: request.install_target,
        };

        self.last_sequence_number = persistence.last_sequence_number();
        slog::info!(
            self.logger,
            "Capturing snapshot: last index {}, last applied {}, replicated to all {}, install for {:?}",
            capture.last_index,
            capture.last_applied_index,
            capture.replicated_to_all_index,
            capture.install_target
        );
        self.state = State::Capturing(capture);
        true
    }

    /// Saves the captured state and trims the log optimistically. The trim is final on
    /// `commit` and undone on `rollback`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn persist(
        &mut self,
        state: Bytes,
        log: &mut ReplicatedLog,
        persistence: &mut dyn DataPersistenceProvider,
        term_info: TermInfo,
        server_config: Option<ServerConfigurationPayload>,
        thresholds: SnapshotThresholds,
        is_leader: bool,
        callback: SnapshotCallback,
    ) -> PersistOutcome {
        let capture = match std::mem::replace(&mut self.state, State::PersistingCapture) {
            State::Capturing(capture) => capture,
            other => {
                slog::warn!(self.logger, "Received snapshot state while not capturing, ignoring");
                self.state = other;
                return PersistOutcome::default();
            }
        };

        let snapshot = Snapshot {
            state,
            unapplied_entries: capture.unapplied_entries.clone(),
            last_index: capture.last_index,
            last_term: capture.last_term,
            last_applied_index: capture.last_applied_index,
            last_applied_term: capture.last_applied_term,
            term_info,
            server_config,
        };
        persistence.save_snapshot(snapshot.clone(), callback);

        let data_threshold_exceeded = log.data_size() > thresholds.data_threshold;
        let batch_count_exceeded = log.size() as u64 >= thresholds.batch_count;
        let mut outcome = PersistOutcome::default();

        if data_threshold_exceeded || batch_count_exceeded || capture.mandatory_trim {
            slog::debug!(
                self.logger,
                "Trimming to last applied {}: data threshold {}, batch count {}, mandatory {}",
                capture.last_applied_index,
                data_threshold_exceeded,
                batch_count_exceeded,
                capture.mandatory_trim
            );
            log.snapshot_pre_commit(capture.last_applied_index, capture.last_applied_term);
            if is_leader {
                outcome.replicated_to_all_index = Some(capture.last_applied_index);
            }
        } else if capture.replicated_to_all_index != -1 {
            log.snapshot_pre_commit(capture.replicated_to_all_index, capture.replicated_to_all_term);
            outcome.replicated_to_all_index = Some(capture.replicated_to_all_index);
        } else {
            let (index, term) = (log.snapshot_index(), log.snapshot_term());
            log.snapshot_pre_commit(index, term);
        }

        slog::info!(
            self.logger,
            "Removed in-memory snapshotted entries, snapshot index {} term {:?}",
            log.snapshot_index(),
            log.snapshot_term()
        );

        if capture.install_target.is_some() {
            outcome.install = Some(snapshot);
        }
        outcome
    }

    /// Begins durably applying a snapshot sent by the leader.
    pub(crate) fn apply_from_leader(
        &mut self,
        apply: ApplySnapshot,
        persistence: &mut dyn DataPersistenceProvider,
        callback: SnapshotCallback,
    ) -> Result<(), ApplySnapshot> {
        if self.is_capturing() {
            slog::warn!(self.logger, "Cannot apply leader snapshot while another snapshot is in progress");
            return Err(apply);
        }

        self.last_sequence_number = persistence.last_sequence_number();
        persistence.save_snapshot(apply.snapshot.clone(), callback);
        self.state = State::PersistingApply(apply);
        Ok(())
    }

    /// The snapshot is durable. Returns `None` if there was nothing in flight.
    pub(crate) fn commit(
        &mut self,
        metadata: &SnapshotMetadata,
        log: &mut ReplicatedLog,
        persistence: &mut dyn DataPersistenceProvider,
    ) -> Option<CommitOutcome> {
        let state = std::mem::replace(&mut self.state, State::Idle);
        let outcome = match state {
            State::PersistingCapture => {
                log.snapshot_commit(true);
                CommitOutcome::Captured
            }
            State::PersistingApply(apply) => CommitOutcome::Applied(apply),
            State::Idle => return None,
            other @ State::Capturing(_) => {
                slog::warn!(self.logger, "Snapshot saved while still capturing, ignoring");
                self.state = other;
                return None;
            }
        };

        slog::info!(self.logger, "Snapshot committed at sequence number {}", metadata.sequence_nr);
        persistence.delete_snapshots(metadata.sequence_nr.saturating_sub(1));
        persistence.delete_messages(self.last_sequence_number);
        Some(outcome)
    }

    /// Snapshot persistence failed. Undoes the optimistic trim or hands back the failed apply.
    pub(crate) fn rollback(&mut self, log: &mut ReplicatedLog) -> Option<CommitOutcome> {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::PersistingCapture => {
                log.snapshot_rollback();
                slog::info!(
                    self.logger,
                    "Snapshot rolled back, snapshot index {} term {:?}",
                    log.snapshot_index(),
                    log.snapshot_term()
                );
                Some(CommitOutcome::Captured)
            }
            State::PersistingApply(apply) => Some(CommitOutcome::Applied(apply)),
            State::Idle => None,
            State::Capturing(_) => {
                slog::warn!(self.logger, "Snapshot capture abandoned before persisting");
                Some(CommitOutcome::Captured)
            }
        }
    }

    /// Trims the log up to `desired_trim_index` without capturing, keeping the last applied entry.
    /// Returns the index trimmed to, or -1 if nothing was trimmed.
    pub(crate) fn trim_log(&mut self, desired_trim_index: i64, last_applied: i64, log: &mut ReplicatedLog) -> i64 {
        if self.is_capturing() {
            return -1;
        }

        let trim_index = desired_trim_index.min(if last_applied > -1 { last_applied - 1 } else { -1 });
        if trim_index > -1 {
            if let Some(term) = log.get(trim_index).map(|e| e.term) {
                log.snapshot_pre_commit(trim_index, term);
                log.snapshot_commit(false);
                return trim_index;
            }
        }
        -1
    }

    /// Upper bound for raising the behavior's replicated-to-all index when `trim_log` declined.
    pub(crate) fn trim_candidate(desired_trim_index: i64, last_applied: i64) -> i64 {
        desired_trim_index.min(if last_applied > -1 { last_applied - 1 } else { -1 })
    }
}
