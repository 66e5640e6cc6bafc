mod context;
mod election;
mod install_snapshot;
mod leadership_transfer;
mod log_entry;
mod membership;
mod messages;
mod peers;
mod persistence;
mod recovery;
mod replica;
mod replica_api;
mod replicated_log;
mod snapshot;
mod state_machine;
mod term_info;
mod timers;
mod transport;

#[cfg(test)]
mod test_harness;

pub use log_entry::LogEntry;
pub use log_entry::Payload;
pub use membership::ServerChangeReply;
pub use membership::ServerChangeRequest;
pub use membership::ServerChangeStatus;
pub use messages::AppendEntries;
pub use messages::AppendEntriesReply;
pub use messages::InstallSnapshot;
pub use messages::InstallSnapshotReply;
pub use messages::RaftMessage;
pub use messages::RequestVote;
pub use messages::RequestVoteReply;
pub use peers::MemberId;
pub use peers::PeerAddressResolver;
pub use peers::PeerInfo;
pub use peers::ServerConfigurationPayload;
pub use peers::ServerInfo;
pub use peers::VotingState;
pub use persistence::DataPersistenceProvider;
pub use persistence::InMemoryJournal;
pub use persistence::JournalRecord;
pub use persistence::PersistCallback;
pub use persistence::PersistenceError;
pub use persistence::RecoveredState;
pub use persistence::SnapshotCallback;
pub use persistence::SnapshotMetadata;
pub use replica_api::FollowerSummary;
pub use replica_api::LeadershipTransferError;
pub use replica_api::PeerSummary;
pub use replica_api::RaftRole;
pub use replica_api::RaftState;
pub use replica_api::SnapshotRequestError;
pub use replica_api::SubmitError;
pub use replica_api::SubmitOutput;
pub use replica_api::SwitchBehaviorError;
pub use snapshot::Snapshot;
pub use state_machine::RaftStateMachine;
pub use term_info::FileTermInfoStore;
pub use term_info::Term;
pub use term_info::TermInfo;
pub use term_info::TermInfoStore;
pub use term_info::VolatileTermInfoStore;
pub use transport::LocalTransport;
pub use transport::RaftInbox;
pub use transport::RaftTransport;

pub(crate) use context::ReplicaOptions;
pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use persistence::PersistContinuation;
pub(crate) use replica::create_replica;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::LeaderTimerTick;
pub(crate) use timers::TimeoutKind;
