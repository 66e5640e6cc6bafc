use crate::replica::{MemberId, PeerInfo, VotingState};

/// A member this member starts out knowing about.
#[derive(Clone, Debug)]
pub struct RaftPeerConfig {
    pub member_id: String,
    /// Resolved through the configured `PeerAddressResolver` when absent.
    pub address: Option<String>,
    pub voting: bool,
}

impl From<RaftPeerConfig> for PeerInfo {
    fn from(peer: RaftPeerConfig) -> Self {
        let voting_state = if peer.voting {
            VotingState::Voting
        } else {
            VotingState::NonVoting
        };
        PeerInfo::new(MemberId::new(peer.member_id), peer.address, voting_state)
    }
}
