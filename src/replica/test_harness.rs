//! In-process cluster for exercising replicas without timers. Every member's mailbox is pumped by
//! hand, so a test decides exactly when elections, heartbeats and timeouts happen.

use crate::actor::{ActorClient, Callback, Event, ReplicaActor};
use crate::replica::context::ReplicaOptions;
use crate::replica::election::ElectionStateChangeListener;
use crate::replica::messages::{AppendEntriesReply, RaftMessage};
use crate::replica::peers::{MemberId, PeerAddressResolver, PeerInfo, VotingState};
use crate::replica::persistence::{InMemoryJournal, PersistenceError};
use crate::replica::replica::{create_replica, Replica, ReplicaConfig};
use crate::replica::replica_api::{LeaderTimerTick, RaftRole, RaftState, SubmitError, SubmitOutput};
use crate::replica::state_machine::testing::RecordingStateMachine;
use crate::replica::term_info::{TermInfo, TermInfoStore};
use crate::replica::transport::{LocalTransport, RaftInbox, RaftTransport};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::Duration;

const MAX_SETTLE_ROUNDS: usize = 10_000;

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub(crate) fn test_options() -> ReplicaOptions {
    ReplicaOptions {
        leader_heartbeat_duration: Duration::from_millis(1),
        follower_min_timeout: Duration::from_secs(5),
        follower_max_timeout: Duration::from_secs(10),
        snapshot_batch_count: 20_000,
        snapshot_data_threshold: usize::MAX,
        snapshot_chunk_size: 2048,
        max_append_entries: 1000,
        max_append_entries_data_size: 1024 * 1024,
        isolated_check_interval: Duration::from_secs(3600),
        journal_recovery_batch_size: 1000,
        elections_enabled: true,
        spawn_timers: false,
    }
}

/// Term store whose durable copy outlives the replica, so a restarted member finds its vote.
struct SharedTermInfoStore {
    current: TermInfo,
    durable: Arc<Mutex<Option<TermInfo>>>,
    fail_writes: Arc<AtomicBool>,
}

impl TermInfoStore for SharedTermInfoStore {
    fn current(&self) -> &TermInfo {
        &self.current
    }

    fn set_term(&mut self, term_info: TermInfo) {
        self.current = term_info;
    }

    fn store_and_set_term(&mut self, term_info: TermInfo) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Rejected("term writes disabled".to_string()));
        }
        *self.durable.lock().unwrap() = Some(term_info.clone());
        self.current = term_info;
        Ok(())
    }

    fn load_and_set_term(&mut self) -> Result<Option<TermInfo>, PersistenceError> {
        let durable = self.durable.lock().unwrap().clone();
        if let Some(term_info) = &durable {
            self.current = term_info.clone();
        }
        Ok(durable)
    }
}

/// Every member is reachable at `local://<id>`.
struct LocalAddresses;

impl PeerAddressResolver for LocalAddresses {
    fn resolve(&self, peer_id: &MemberId) -> Option<String> {
        Some(format!("local://{}", peer_id))
    }
}

/// Forwards to the local transport and remembers every AppendEntriesReply by sender, and the
/// address each member was last sent to.
struct RecordingTransport {
    inner: LocalTransport,
    replies: Arc<Mutex<HashMap<MemberId, Vec<AppendEntriesReply>>>>,
    addresses: Arc<Mutex<HashMap<MemberId, Option<String>>>>,
}

impl RaftTransport for RecordingTransport {
    fn send(&self, from: &MemberId, to: &MemberId, to_address: Option<&str>, message: RaftMessage) {
        self.addresses
            .lock()
            .unwrap()
            .insert(to.clone(), to_address.map(str::to_string));
        if let RaftMessage::AppendEntriesReply(reply) = &message {
            self.replies
                .lock()
                .unwrap()
                .entry(from.clone())
                .or_default()
                .push(reply.clone());
        }
        self.inner.send(from, to, to_address, message);
    }
}

struct Member {
    actor: ReplicaActor,
    client: ActorClient,
    state_machine: RecordingStateMachine,
    journal: InMemoryJournal,
    durable_term: Arc<Mutex<Option<TermInfo>>>,
    term_writes_fail: Arc<AtomicBool>,
    peers: Vec<MemberId>,
    _listener: ElectionStateChangeListener,
}

pub(crate) struct TestCluster {
    pub(crate) transport: LocalTransport,
    replies: Arc<Mutex<HashMap<MemberId, Vec<AppendEntriesReply>>>>,
    addresses: Arc<Mutex<HashMap<MemberId, Option<String>>>>,
    options: ReplicaOptions,
    members: Vec<(MemberId, Member)>,
}

impl TestCluster {
    pub(crate) fn new(ids: &[&str]) -> Self {
        Self::with_options(ids, |_| {})
    }

    pub(crate) fn with_options(ids: &[&str], configure: impl Fn(&mut ReplicaOptions)) -> Self {
        let mut options = test_options();
        configure(&mut options);

        let mut cluster = TestCluster {
            transport: LocalTransport::new(test_logger()),
            replies: Arc::new(Mutex::new(HashMap::new())),
            addresses: Arc::new(Mutex::new(HashMap::new())),
            options,
            members: Vec::new(),
        };
        for id in ids {
            cluster.add_member(id, ids);
        }
        cluster
    }

    /// Creates a member that knows `peers`. It isn't started.
    pub(crate) fn add_member(&mut self, id: &str, peers: &[&str]) {
        let member_id = MemberId::new(id);
        let peers: Vec<MemberId> = peers
            .iter()
            .map(|p| MemberId::new(*p))
            .filter(|p| p != &member_id)
            .collect();
        let member = self.build_member(
            member_id.clone(),
            peers,
            InMemoryJournal::new(),
            Arc::new(Mutex::new(None)),
        );
        self.members.push((member_id, member));
    }

    fn build_member(
        &self,
        member_id: MemberId,
        peers: Vec<MemberId>,
        journal: InMemoryJournal,
        durable_term: Arc<Mutex<Option<TermInfo>>>,
    ) -> Member {
        let (client, receiver) = ActorClient::new(1000);
        let state_machine = RecordingStateMachine::default();
        let transport = RecordingTransport {
            inner: self.transport.clone(),
            replies: self.replies.clone(),
            addresses: self.addresses.clone(),
        };
        let logger = test_logger();
        let term_writes_fail = Arc::new(AtomicBool::new(false));

        let (replica, listener) = create_replica(ReplicaConfig {
            logger: logger.clone(),
            my_id: member_id.clone(),
            peers: peers
                .iter()
                .map(|p| PeerInfo::new(p.clone(), None, VotingState::Voting))
                .collect(),
            address_resolver: Some(Arc::new(LocalAddresses)),
            options: self.options.clone(),
            term_store: Box::new(SharedTermInfoStore {
                current: TermInfo::initial(),
                durable: durable_term.clone(),
                fail_writes: term_writes_fail.clone(),
            }),
            persistence: Box::new(journal.clone()),
            state_machine: Box::new(state_machine.clone()),
            transport: Arc::new(transport),
            actor_client: client.weak(),
        })
        .unwrap();

        self.transport.register(member_id, RaftInbox::new(client.weak()));
        Member {
            actor: ReplicaActor::new(logger, receiver, replica),
            client,
            state_machine,
            journal,
            durable_term,
            term_writes_fail,
            peers,
            _listener: listener,
        }
    }

    pub(crate) fn start(&mut self) {
        for (_, member) in &mut self.members {
            member.actor.replica_mut().start();
        }
    }

    /// Pumps every mailbox until nothing is left to handle.
    pub(crate) async fn settle(&mut self) {
        let mut idle_rounds = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut handled = 0;
            for (_, member) in &mut self.members {
                if !member.actor.replica().is_stopped() {
                    handled += member.actor.pump();
                }
            }
            if handled > 0 {
                idle_rounds = 0;
                continue;
            }
            // Mailbox sends that didn't fit run on spawned tasks. Give them a chance.
            idle_rounds += 1;
            if idle_rounds > 2 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("Cluster did not settle after {} rounds", MAX_SETTLE_ROUNDS);
    }

    fn member(&self, id: &str) -> &Member {
        self.members
            .iter()
            .find(|(member_id, _)| member_id.as_str() == id)
            .map(|(_, m)| m)
            .unwrap_or_else(|| panic!("No member {}", id))
    }

    fn member_mut(&mut self, id: &str) -> &mut Member {
        self.members
            .iter_mut()
            .find(|(member_id, _)| member_id.as_str() == id)
            .map(|(_, m)| m)
            .unwrap_or_else(|| panic!("No member {}", id))
    }

    pub(crate) fn replica_mut(&mut self, id: &str) -> &mut Replica {
        self.member_mut(id).actor.replica_mut()
    }

    pub(crate) fn state(&self, id: &str) -> RaftState {
        self.member(id).actor.replica().get_state()
    }

    pub(crate) fn deliver(&self, id: &str, message: RaftMessage) {
        self.member(id).client.weak().deliver(Event::Raft(message));
    }

    /// Makes `id` start an election on its next pump.
    pub(crate) fn trigger_election(&self, id: &str) {
        self.deliver(id, RaftMessage::TimeoutNow);
    }

    pub(crate) async fn elect(&mut self, id: &str) {
        self.trigger_election(id);
        self.settle().await;
        assert_eq!(self.state(id).role, RaftRole::Leader, "{} did not win the election", id);
    }

    /// Fires the leader's per-follower timer once for every follower.
    pub(crate) fn heartbeat(&mut self, id: &str) {
        // Entries are only resent once a heartbeat interval has passed.
        std::thread::sleep(self.options.leader_heartbeat_duration * 2);
        let state = self.state(id);
        let replica = self.replica_mut(id);
        for follower in state.followers {
            replica.leader_timer(LeaderTimerTick {
                peer_id: follower.id,
                term: state.term,
            });
        }
    }

    pub(crate) async fn submit(&mut self, id: &str, data: impl Into<Bytes>) -> Result<SubmitOutput, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.member(id)
            .client
            .weak()
            .deliver(Event::Submit(data.into(), Callback::new(tx)));
        self.settle().await;
        rx.await.unwrap_or(Err(SubmitError::ActorExited))
    }

    pub(crate) fn submit_no_wait(&mut self, id: &str, data: impl Into<Bytes>) {
        let (tx, _) = oneshot::channel();
        self.member(id)
            .client
            .weak()
            .deliver(Event::Submit(data.into(), Callback::new(tx)));
    }

    pub(crate) fn applied(&self, id: &str) -> Vec<(i64, Bytes)> {
        self.member(id).state_machine.applied()
    }

    pub(crate) fn applied_indexes(&self, id: &str) -> Vec<i64> {
        self.member(id).state_machine.applied_indexes()
    }

    pub(crate) fn journal(&self, id: &str) -> &InMemoryJournal {
        &self.member(id).journal
    }

    /// Makes every subsequent term store write of `id` fail until reset.
    pub(crate) fn fail_term_writes(&self, id: &str, fail: bool) {
        self.member(id).term_writes_fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn sent_append_entries_replies(&self, id: &str) -> Vec<AppendEntriesReply> {
        self.replies
            .lock()
            .unwrap()
            .get(&MemberId::new(id))
            .cloned()
            .unwrap_or_default()
    }

    /// The address the last message to `id` was sent to. Outer `None` if nothing was sent.
    pub(crate) fn last_address_sent_to(&self, id: &str) -> Option<Option<String>> {
        self.addresses.lock().unwrap().get(&MemberId::new(id)).cloned()
    }

    /// Replaces the member with one recovered from the same journal and term store, and starts it.
    /// Returns the new member's state machine.
    pub(crate) fn restart(&mut self, id: &str) -> RecordingStateMachine {
        let position = self
            .members
            .iter()
            .position(|(member_id, _)| member_id.as_str() == id)
            .unwrap_or_else(|| panic!("No member {}", id));
        let (member_id, old) = self.members.remove(position);
        self.transport.unregister(&member_id);

        let mut member = self.build_member(member_id.clone(), old.peers.clone(), old.journal.clone(), old.durable_term.clone());
        drop(old);
        member.actor.replica_mut().start();
        let state_machine = member.state_machine.clone();
        self.members.insert(position, (member_id, member));
        state_machine
    }
}
