use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// MemberId identifies one member of a raft cluster.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        MemberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        MemberId::new(id)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VotingState {
    Voting,
    NonVoting,
    /// Added as a voter but still waiting for its first snapshot. Does not count toward majority.
    VotingNotInitialized,
}

#[derive(Clone, Debug)]
pub struct PeerInfo {
    id: MemberId,
    // Set at most once: configured up front or resolved on first use.
    address: OnceLock<String>,
    voting_state: VotingState,
}

impl PeerInfo {
    pub fn new(id: MemberId, address: Option<String>, voting_state: VotingState) -> Self {
        let cell = OnceLock::new();
        if let Some(address) = address {
            let _ = cell.set(address);
        }
        PeerInfo {
            id,
            address: cell,
            voting_state,
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn address(&self) -> Option<&str> {
        self.address.get().map(String::as_str)
    }

    pub fn voting_state(&self) -> VotingState {
        self.voting_state
    }

    pub fn is_voting(&self) -> bool {
        self.voting_state == VotingState::Voting
    }
}

/// PeerAddressResolver is consulted the first time a peer's address is needed and the peer was
/// registered without one.
pub trait PeerAddressResolver: Send + Sync {
    fn resolve(&self, peer_id: &MemberId) -> Option<String>;
}

/// One server in a membership configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerInfo {
    pub id: MemberId,
    pub is_voting: bool,
}

/// ServerConfigurationPayload is the full cluster membership, including the member that wrote it.
/// It travels through the log as a regular entry and is embedded in snapshots.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerConfigurationPayload {
    pub servers: Vec<ServerInfo>,
}

impl ServerConfigurationPayload {
    pub(crate) fn serialized_size(&self) -> usize {
        self.servers.iter().map(|s| s.id.as_str().len() + 1).sum()
    }
}

/// Peers is the local member's registry of every other cluster member.
pub(crate) struct Peers {
    my_id: MemberId,
    peers: HashMap<MemberId, PeerInfo>,
    voting_member: bool,
    dynamic_config_in_use: bool,
    address_resolver: Option<Arc<dyn PeerAddressResolver>>,
    logger: slog::Logger,
}

impl Peers {
    pub(crate) fn new(
        logger: slog::Logger,
        my_id: MemberId,
        initial_peers: Vec<PeerInfo>,
        address_resolver: Option<Arc<dyn PeerAddressResolver>>,
    ) -> Self {
        let peers = initial_peers
            .into_iter()
            .filter(|p| p.id != my_id)
            .map(|p| (p.id.clone(), p))
            .collect();

        Peers {
            my_id,
            peers,
            voting_member: true,
            dynamic_config_in_use: false,
            address_resolver,
            logger,
        }
    }

    pub(crate) fn is_voting_member(&self) -> bool {
        self.voting_member
    }

    pub(crate) fn set_voting_member(&mut self, voting: bool) {
        self.voting_member = voting;
    }

    pub(crate) fn get(&self, id: &MemberId) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub(crate) fn contains(&self, id: &MemberId) -> bool {
        self.peers.contains_key(id)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = &MemberId> {
        self.peers.keys()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub(crate) fn voting_peer_ids(&self) -> Vec<MemberId> {
        self.peers
            .values()
            .filter(|p| p.is_voting())
            .map(|p| p.id.clone())
            .collect()
    }

    pub(crate) fn voting_peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_voting()).count()
    }

    pub(crate) fn any_voting_peers(&self) -> bool {
        self.peers.values().any(|p| p.is_voting())
    }

    pub(crate) fn add(&mut self, id: MemberId, address: Option<String>, voting_state: VotingState) {
        if id == self.my_id {
            return;
        }
        slog::info!(self.logger, "Adding peer {:?} ({:?})", id, voting_state);
        self.peers
            .insert(id.clone(), PeerInfo::new(id, address, voting_state));
    }

    pub(crate) fn remove(&mut self, id: &MemberId) -> Option<PeerInfo> {
        if id == &self.my_id {
            self.voting_member = false;
            return None;
        }
        let removed = self.peers.remove(id);
        if removed.is_some() {
            slog::info!(self.logger, "Removed peer {:?}", id);
        }
        removed
    }

    pub(crate) fn set_voting_state(&mut self, id: &MemberId, voting_state: VotingState) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.voting_state = voting_state;
        }
    }

    pub(crate) fn set_dynamic_config_in_use(&mut self) {
        self.dynamic_config_in_use = true;
    }

    /// Returns the peer's address, resolving and caching it if the peer was added without one.
    /// A failed resolution is retried on the next call.
    pub(crate) fn peer_address(&self, id: &MemberId) -> Option<&str> {
        let peer = self.peers.get(id)?;
        if peer.address.get().is_none() {
            if let Some(resolved) = self.address_resolver.as_ref().and_then(|r| r.resolve(id)) {
                slog::debug!(self.logger, "Resolved address of {} to {}", id, resolved);
                let _ = peer.address.set(resolved);
            }
        }
        peer.address()
    }

    /// Applies a membership configuration: peers missing from it are removed, new ones added and
    /// existing ones get the configured voting state. We are non-voting if we are absent from it.
    pub(crate) fn update_from_config(&mut self, config: &ServerConfigurationPayload) {
        let mut stale: Vec<MemberId> = self.peers.keys().cloned().collect();
        let mut found_self = false;
        let mut voting_member = true;

        for server in &config.servers {
            if server.id == self.my_id {
                found_self = true;
                voting_member = server.is_voting;
                continue;
            }
            let voting_state = if server.is_voting {
                VotingState::Voting
            } else {
                VotingState::NonVoting
            };
            match self.peers.get_mut(&server.id) {
                Some(peer) => {
                    peer.voting_state = voting_state;
                    stale.retain(|id| id != &server.id);
                }
                None => self.add(server.id.clone(), None, voting_state),
            }
        }

        for id in stale {
            self.remove(&id);
        }

        self.voting_member = found_self && voting_member;
        self.dynamic_config_in_use = true;
    }

    /// Membership to record in snapshots and send with the last install-snapshot chunk. `None`
    /// while the cluster still runs on its static startup configuration.
    pub(crate) fn dynamic_server_config(&self) -> Option<ServerConfigurationPayload> {
        if self.dynamic_config_in_use {
            Some(self.server_config(true))
        } else {
            None
        }
    }

    /// Current membership as a configuration payload, optionally including ourselves.
    pub(crate) fn server_config(&self, include_self: bool) -> ServerConfigurationPayload {
        let mut servers: Vec<ServerInfo> = self
            .peers
            .values()
            .map(|p| ServerInfo {
                id: p.id.clone(),
                is_voting: p.is_voting(),
            })
            .collect();
        if include_self {
            servers.push(ServerInfo {
                id: self.my_id.clone(),
                is_voting: self.voting_member,
            });
        }
        servers.sort_by(|a, b| a.id.cmp(&b.id));

        ServerConfigurationPayload { servers }
    }
}

/// Majority of votes needed among `num_voting_peers` peers plus ourselves. Zero when alone.
pub(crate) fn majority_vote_count(num_voting_peers: usize) -> usize {
    if num_voting_peers == 0 {
        0
    } else {
        (num_voting_peers + 1) / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peers(ids: &[&str]) -> Peers {
        let infos = ids
            .iter()
            .map(|id| PeerInfo::new(MemberId::new(*id), None, VotingState::Voting))
            .collect();
        Peers::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            MemberId::new("me"),
            infos,
            None,
        )
    }

    #[test]
    fn majority_vote_count_includes_self() {
        assert_eq!(majority_vote_count(0), 0);
        assert_eq!(majority_vote_count(1), 2);
        assert_eq!(majority_vote_count(2), 2);
        assert_eq!(majority_vote_count(3), 3);
        assert_eq!(majority_vote_count(4), 3);
    }

    #[test]
    fn update_from_config_adds_removes_and_flips_voting() {
        let mut peers = peers(&["a", "b"]);
        let config = ServerConfigurationPayload {
            servers: vec![
                ServerInfo {
                    id: MemberId::new("b"),
                    is_voting: false,
                },
                ServerInfo {
                    id: MemberId::new("c"),
                    is_voting: true,
                },
                ServerInfo {
                    id: MemberId::new("me"),
                    is_voting: true,
                },
            ],
        };

        peers.update_from_config(&config);

        assert!(!peers.contains(&MemberId::new("a")));
        assert_eq!(
            peers.get(&MemberId::new("b")).map(|p| p.voting_state()),
            Some(VotingState::NonVoting)
        );
        assert!(peers.get(&MemberId::new("c")).unwrap().is_voting());
        assert!(peers.is_voting_member());
        assert_eq!(peers.server_config(true), config_sorted(config));
    }

    #[test]
    fn absent_from_config_means_non_voting() {
        let mut peers = peers(&["a"]);
        peers.update_from_config(&ServerConfigurationPayload {
            servers: vec![ServerInfo {
                id: MemberId::new("a"),
                is_voting: true,
            }],
        });

        assert!(!peers.is_voting_member());
    }

    #[test]
    fn snapshots_carry_membership_only_once_it_changed() {
        let mut peers = peers(&["a"]);
        assert_eq!(peers.dynamic_server_config(), None);

        peers.set_dynamic_config_in_use();

        assert_eq!(peers.dynamic_server_config(), Some(peers.server_config(true)));
    }

    #[derive(Default)]
    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl PeerAddressResolver for CountingResolver {
        fn resolve(&self, peer_id: &MemberId) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(format!("local://{}", peer_id))
        }
    }

    #[test]
    fn peer_address_is_resolved_once_and_cached() {
        let resolver = Arc::new(CountingResolver::default());
        let peers = Peers::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            MemberId::new("me"),
            vec![
                PeerInfo::new(MemberId::new("a"), None, VotingState::Voting),
                PeerInfo::new(MemberId::new("b"), Some("static://b".to_string()), VotingState::Voting),
            ],
            Some(resolver.clone()),
        );
        assert_eq!(peers.get(&MemberId::new("a")).unwrap().address(), None);

        assert_eq!(peers.peer_address(&MemberId::new("a")), Some("local://a"));
        assert_eq!(peers.peer_address(&MemberId::new("a")), Some("local://a"));
        assert_eq!(peers.get(&MemberId::new("a")).unwrap().address(), Some("local://a"));
        assert_eq!(peers.peer_address(&MemberId::new("b")), Some("static://b"));
        assert_eq!(peers.peer_address(&MemberId::new("zzz")), None);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    fn config_sorted(mut config: ServerConfigurationPayload) -> ServerConfigurationPayload {
        config.servers.sort_by(|a, b| a.id.cmp(&b.id));
        config
    }
}
