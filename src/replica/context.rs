use crate::actor::WeakActorClient;
use crate::replica::messages::RaftMessage;
use crate::replica::peers::{MemberId, Peers};
use crate::replica::persistence::{DataPersistenceProvider, PersistenceError};
use crate::replica::replicated_log::ReplicatedLog;
use crate::replica::snapshot::{SnapshotManager, SnapshotThresholds};
use crate::replica::state_machine::RaftStateMachine;
use crate::replica::term_info::{Term, TermInfo, TermInfoStore};
use crate::replica::transport::RaftTransport;
use std::sync::Arc;
use tokio::time::Duration;

/// Validated tuning knobs for one member.
#[derive(Clone, Debug)]
pub(crate) struct ReplicaOptions {
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) snapshot_batch_count: u64,
    pub(crate) snapshot_data_threshold: usize,
    pub(crate) snapshot_chunk_size: usize,
    pub(crate) max_append_entries: usize,
    pub(crate) max_append_entries_data_size: usize,
    pub(crate) isolated_check_interval: Duration,
    pub(crate) journal_recovery_batch_size: usize,
    pub(crate) elections_enabled: bool,
    /// False when a harness drives timeouts and heartbeats by hand.
    pub(crate) spawn_timers: bool,
}

impl ReplicaOptions {
    /// How long a follower may stay silent before the leader considers it inactive.
    pub(crate) fn election_timeout(&self) -> Duration {
        self.follower_max_timeout
    }

    /// Budget for membership changes and leadership transfers.
    pub(crate) fn operation_timeout(&self) -> Duration {
        self.follower_max_timeout * 2
    }

    pub(crate) fn snapshot_thresholds(&self) -> SnapshotThresholds {
        SnapshotThresholds {
            batch_count: self.snapshot_batch_count,
            data_threshold: self.snapshot_data_threshold,
        }
    }
}

/// RaftContext is everything a member owns regardless of its role.
pub(crate) struct RaftContext {
    pub(crate) logger: slog::Logger,
    pub(crate) my_id: MemberId,
    pub(crate) options: ReplicaOptions,
    pub(crate) term_store: Box<dyn TermInfoStore>,
    pub(crate) persistence: Box<dyn DataPersistenceProvider>,
    pub(crate) log: ReplicatedLog,
    pub(crate) peers: Peers,
    pub(crate) snapshot_manager: SnapshotManager,
    pub(crate) state_machine: Box<dyn RaftStateMachine>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) actor_client: WeakActorClient,

    // > index of highest log entry known to be committed
    pub(crate) commit_index: i64,
    // > index of highest log entry applied to state machine
    pub(crate) last_applied: i64,
    // Lowest index every follower has. Entries up to it may be trimmed anywhere.
    pub(crate) replicated_to_all_index: i64,
}

impl RaftContext {
    pub(crate) fn current_term(&self) -> Term {
        self.term_store.current().term
    }

    pub(crate) fn voted_for(&self) -> Option<&MemberId> {
        self.term_store.current().voted_for.as_ref()
    }

    pub(crate) fn term_info(&self) -> TermInfo {
        self.term_store.current().clone()
    }

    /// Durably moves to `term`. The in-memory value only changes if the write succeeded.
    pub(crate) fn persist_term(&mut self, term: Term, voted_for: Option<MemberId>) -> Result<(), PersistenceError> {
        let result = self.term_store.store_and_set_term(TermInfo::new(term, voted_for));
        if let Err(e) = &result {
            slog::error!(self.logger, "Failed to persist term {:?}: {:?}", term, e);
        }
        result
    }

    pub(crate) fn send(&self, to: &MemberId, message: RaftMessage) {
        slog::trace!(self.logger, "Sending {} to {}", message.name(), to);
        let address = self.peers.peer_address(to);
        self.transport.send(&self.my_id, to, address, message);
    }

    pub(crate) fn can_start_election(&self) -> bool {
        self.options.elections_enabled && self.peers.is_voting_member()
    }
}
