// Nothing but `mod` and re-exports at the root. Modules are never `pub`.
mod actor;
mod api;
mod client;
mod clock;
mod properties;
mod replica;

pub use actor::ActorExited;

pub use api::try_create_raft_member;
pub use api::RaftClient;
pub use api::RaftElectionState;
pub use api::RaftError;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftMember;
pub use api::RaftMemberConfig;
pub use api::RaftOptions;
pub use api::RaftPeerConfig;

pub use replica::AppendEntries;
pub use replica::AppendEntriesReply;
pub use replica::DataPersistenceProvider;
pub use replica::FileTermInfoStore;
pub use replica::FollowerSummary;
pub use replica::InMemoryJournal;
pub use replica::InstallSnapshot;
pub use replica::InstallSnapshotReply;
pub use replica::JournalRecord;
pub use replica::LeadershipTransferError;
pub use replica::LocalTransport;
pub use replica::LogEntry;
pub use replica::MemberId;
pub use replica::Payload;
pub use replica::PeerAddressResolver;
pub use replica::PeerInfo;
pub use replica::PeerSummary;
pub use replica::PersistCallback;
pub use replica::PersistenceError;
pub use replica::RaftInbox;
pub use replica::RaftMessage;
pub use replica::RaftRole;
pub use replica::RaftState;
pub use replica::RaftStateMachine;
pub use replica::RaftTransport;
pub use replica::RecoveredState;
pub use replica::RequestVote;
pub use replica::RequestVoteReply;
pub use replica::ServerChangeReply;
pub use replica::ServerChangeRequest;
pub use replica::ServerChangeStatus;
pub use replica::ServerConfigurationPayload;
pub use replica::ServerInfo;
pub use replica::Snapshot;
pub use replica::SnapshotCallback;
pub use replica::SnapshotMetadata;
pub use replica::SnapshotRequestError;
pub use replica::SubmitError;
pub use replica::SubmitOutput;
pub use replica::SwitchBehaviorError;
pub use replica::Term;
pub use replica::TermInfo;
pub use replica::TermInfoStore;
pub use replica::VolatileTermInfoStore;
pub use replica::VotingState;

pub use client::try_create_shard_client;
pub use client::BackendInfo;
pub use client::BackendInfoResolver;
pub use client::ClientError;
pub use client::ClientIdentifier;
pub use client::ClientOptions;
pub use client::PendingResponse;
pub use client::Request;
pub use client::RequestEnvelope;
pub use client::RequestError;
pub use client::RequestSink;
pub use client::ResolveError;
pub use client::ResponseEnvelope;
pub use client::ShardClient;
pub use client::ShardClientConfig;
pub use client::ShardCookie;
pub use client::StaleCallback;
pub use client::StaleRegistration;
pub use client::StateFileError;
