use crate::replica::peers::{MemberId, VotingState};
use crate::replica::persistence::PersistenceError;
use crate::replica::term_info::Term;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    /// A leader that lost contact with a voting majority. It keeps accepting writes, but they stay
    /// uncommitted until the majority is back.
    IsolatedLeader,
}

impl RaftRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader | RaftRole::IsolatedLeader)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubmitOutput {
    pub index: i64,
    pub term: Term,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("I'm not leader")]
    NotLeader { leader_hint: Option<MemberId> },

    #[error("Failed to persist entry")]
    Persistence(#[source] PersistenceError),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum LeadershipTransferError {
    #[error("Cannot transfer leadership, this member is not the leader")]
    NotLeader,

    #[error("Failed to transfer leadership to {target:?}, follower is not ready to become leader")]
    NotTransferred { target: Option<MemberId> },

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum SnapshotRequestError {
    #[error("A snapshot is already in progress")]
    AlreadyInProgress,

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub enum SwitchBehaviorError {
    #[error("Switching behavior manually requires elections to be disabled")]
    ElectionsEnabled,

    #[error("Switching to {0:?} is not supported")]
    UnsupportedRole(RaftRole),

    #[error("Failed to persist term")]
    Persistence(#[source] PersistenceError),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub id: MemberId,
    pub address: Option<String>,
    pub voting_state: VotingState,
}

/// Leader's view of one follower.
#[derive(Debug, Clone)]
pub struct FollowerSummary {
    pub id: MemberId,
    pub next_index: i64,
    pub match_index: i64,
    pub is_active: bool,
    pub is_voting: bool,
    pub time_since_last_activity: Duration,
}

/// Point in time view of a member, answered by the replica task.
#[derive(Debug, Clone)]
pub struct RaftState {
    pub member_id: MemberId,
    pub role: RaftRole,
    pub term: Term,
    pub voted_for: Option<MemberId>,
    pub leader_id: Option<MemberId>,
    pub is_voting: bool,
    pub commit_index: i64,
    pub last_applied: i64,
    pub last_index: i64,
    pub last_term: Term,
    pub snapshot_index: i64,
    pub snapshot_term: Term,
    pub replicated_to_all_index: i64,
    pub in_memory_journal_size: usize,
    pub in_memory_journal_data_size: usize,
    pub is_snapshot_capture_in_progress: bool,
    pub peers: Vec<PeerSummary>,
    pub followers: Vec<FollowerSummary>,
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: MemberId,
    pub(crate) term: Term,
}
