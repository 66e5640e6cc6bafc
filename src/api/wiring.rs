use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftClient;
use crate::api::event_bus::RaftEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::types::RaftPeerConfig;
use crate::replica;
use crate::replica::{
    DataPersistenceProvider, MemberId, PeerAddressResolver, PeerInfo, PersistenceError, RaftInbox, RaftStateMachine,
    RaftTransport, ReplicaConfig, TermInfoStore,
};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::sync::Arc;

const MAILBOX_SIZE: usize = 1024;

pub struct RaftMemberConfig {
    pub my_member_id: String,
    pub peers: Vec<RaftPeerConfig>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
    pub term_store: Box<dyn TermInfoStore>,
    pub persistence: Box<dyn DataPersistenceProvider>,
    pub state_machine: Box<dyn RaftStateMachine>,
    pub transport: Arc<dyn RaftTransport>,
    pub address_resolver: Option<Arc<dyn PeerAddressResolver>>,
}

/// A running raft member. Messages for it go to `inbox`.
pub struct RaftMember {
    pub client: RaftClient,
    pub event_listener: RaftEventListener,
    pub inbox: RaftInbox,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring member: {0}")]
    IllegalOptions(String),
    #[error("Failed to recover persisted state")]
    Recovery(#[source] PersistenceError),
}

/// Recovers a member from its term store and journal and starts it on a new task.
pub async fn try_create_raft_member(config: RaftMemberConfig) -> Result<RaftMember, RaftError> {
    let my_member_id = MemberId::new(config.my_member_id);
    let root_logger = config
        .info_logger
        .new(slog::o!("MemberId" => my_member_id.to_string()));

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftError::IllegalOptions(e.to_string()))?;
    let peers = validate_peers(&my_member_id, config.peers)?;

    let (actor_client, actor_queue_rx) = ActorClient::new(MAILBOX_SIZE);

    let (replica, election_state_change_listener) = replica::create_replica(ReplicaConfig {
        logger: root_logger.clone(),
        my_id: my_member_id,
        peers,
        address_resolver: config.address_resolver,
        options: options.into_replica_options(),
        term_store: config.term_store,
        persistence: config.persistence,
        state_machine: config.state_machine,
        transport: config.transport,
        actor_client: actor_client.weak(),
    })
    .map_err(RaftError::Recovery)?;

    let inbox = RaftInbox::new(actor_client.weak());
    let replica_actor = ReplicaActor::new(root_logger, actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    Ok(RaftMember {
        client: RaftClient::new(actor_client),
        event_listener: RaftEventListener::new(election_state_change_listener),
        inbox,
    })
}

fn validate_peers(my_member_id: &MemberId, peers: Vec<RaftPeerConfig>) -> Result<Vec<PeerInfo>, RaftError> {
    let mut seen = HashSet::new();
    let mut validated = Vec::with_capacity(peers.len());
    for peer in peers {
        let peer = PeerInfo::from(peer);
        if peer.id() == my_member_id {
            return Err(RaftError::InvalidClusterInfo(format!(
                "{} is listed as its own peer",
                my_member_id
            )));
        }
        if !seen.insert(peer.id().clone()) {
            return Err(RaftError::InvalidClusterInfo(format!("{} is listed twice", peer.id())));
        }
        validated.push(peer);
    }

    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> RaftPeerConfig {
        RaftPeerConfig {
            member_id: id.to_string(),
            address: None,
            voting: true,
        }
    }

    #[test]
    fn peers_must_not_include_me_or_repeat() {
        let me = MemberId::new("a");
        assert!(validate_peers(&me, vec![peer("b"), peer("c")]).is_ok());
        assert!(matches!(
            validate_peers(&me, vec![peer("b"), peer("a")]),
            Err(RaftError::InvalidClusterInfo(_))
        ));
        assert!(matches!(
            validate_peers(&me, vec![peer("b"), peer("b")]),
            Err(RaftError::InvalidClusterInfo(_))
        ));
    }
}
