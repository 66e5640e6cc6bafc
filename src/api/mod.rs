//! This mod is meant to hold most of the code for the library's application-facing API.
mod client;
mod event_bus;
mod options;
mod types;
mod wiring;

pub use client::RaftClient;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use options::RaftOptions;
pub use types::RaftPeerConfig;
pub use wiring::try_create_raft_member;
pub use wiring::RaftError;
pub use wiring::RaftMember;
pub use wiring::RaftMemberConfig;
