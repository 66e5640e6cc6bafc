use crate::replica::log_entry::LogEntry;
use crate::replica::membership::{ServerChangeReply, ServerChangeRequest};
use crate::replica::peers::{MemberId, ServerConfigurationPayload};
use crate::replica::term_info::Term;
use bytes::Bytes;
use tokio::sync::oneshot;

/// Chunk index sent back by a follower that rejected an install-snapshot chunk.
pub const INVALID_CHUNK_INDEX: i32 = -1;
pub const FIRST_CHUNK_INDEX: i32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: MemberId,
    pub last_log_index: i64,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestVoteReply {
    pub term: Term,
    pub voter_id: MemberId,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: MemberId,
    pub prev_log_index: i64,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: i64,
    /// Lowest index the leader knows every follower has. Followers may trim up to it.
    pub replicated_to_all_index: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendEntriesReply {
    pub follower_id: MemberId,
    pub term: Term,
    pub success: bool,
    pub log_last_index: i64,
    pub log_last_term: Term,
    /// The follower's log conflicts inside its snapshot. Only a snapshot install can repair it.
    pub force_install_snapshot: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: MemberId,
    pub last_included_index: i64,
    pub last_included_term: Term,
    pub data: Bytes,
    pub chunk_index: i32,
    pub total_chunks: i32,
    /// Hash of the previous chunk, absent on the first one.
    pub last_chunk_hash: Option<u64>,
    /// Sent with the last chunk only.
    pub server_config: Option<ServerConfigurationPayload>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallSnapshotReply {
    pub term: Term,
    pub follower_id: MemberId,
    pub chunk_index: i32,
    pub success: bool,
}

/// Everything members send each other.
#[derive(Debug)]
pub enum RaftMessage {
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotReply(InstallSnapshotReply),
    /// Start an election right away. Sent by a leader handing over leadership.
    TimeoutNow,
    /// The sender is handing over leadership and should no longer be considered leader.
    LeaderTransitioning { leader_id: MemberId },
    /// The receiver was removed from the cluster configuration.
    ServerRemoved { server_id: MemberId },
    /// A membership change forwarded by a member that isn't leader.
    ServerChange(ServerChangeRequest, oneshot::Sender<ServerChangeReply>),
}

impl RaftMessage {
    /// Term carried by the message, for the messages that take part in the term protocol.
    pub(crate) fn term(&self) -> Option<Term> {
        match self {
            RaftMessage::RequestVote(m) => Some(m.term),
            RaftMessage::RequestVoteReply(m) => Some(m.term),
            RaftMessage::AppendEntries(m) => Some(m.term),
            RaftMessage::AppendEntriesReply(m) => Some(m.term),
            RaftMessage::InstallSnapshot(m) => Some(m.term),
            RaftMessage::InstallSnapshotReply(m) => Some(m.term),
            RaftMessage::TimeoutNow
            | RaftMessage::LeaderTransitioning { .. }
            | RaftMessage::ServerRemoved { .. }
            | RaftMessage::ServerChange(..) => None,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) => "RequestVote",
            RaftMessage::RequestVoteReply(_) => "RequestVoteReply",
            RaftMessage::AppendEntries(_) => "AppendEntries",
            RaftMessage::AppendEntriesReply(_) => "AppendEntriesReply",
            RaftMessage::InstallSnapshot(_) => "InstallSnapshot",
            RaftMessage::InstallSnapshotReply(_) => "InstallSnapshotReply",
            RaftMessage::TimeoutNow => "TimeoutNow",
            RaftMessage::LeaderTransitioning { .. } => "LeaderTransitioning",
            RaftMessage::ServerRemoved { .. } => "ServerRemoved",
            RaftMessage::ServerChange(..) => "ServerChange",
        }
    }
}
