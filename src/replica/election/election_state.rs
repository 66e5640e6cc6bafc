use crate::actor::{Callback, WeakActorClient};
use crate::replica::election::leader_state::{FollowerLogInformation, LeaderStateTracker};
use crate::replica::election::state_change_listener::{
    self, ElectionStateChangeListener, ElectionStateChangeNotifier, ElectionStateSnapshot,
};
use crate::replica::install_snapshot::SnapshotTracker;
use crate::replica::snapshot::Snapshot;
use crate::replica::timers::{FollowerTimerHandle, LeaderTimerHandle};
use crate::replica::{MemberId, RaftRole, SubmitError, SubmitOutput, Term, VotingState};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_id: MemberId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    /// Off only when something else drives follower timeouts and heartbeats by hand.
    pub spawn_timers: bool,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

enum State {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    IsolatedLeader(LeaderState),
    /// Terminal. Also stands in while moving a leader's state between the two leader variants.
    Stopped,
}

pub(crate) struct FollowerState {
    leader_id: Option<MemberId>,
    // None until a leader (or a candidate we voted for) was heard from.
    last_leader_message: Option<Instant>,
    snapshot_tracker: Option<SnapshotTracker>,
    timer: Option<FollowerTimerHandle>,
}

pub(crate) struct CandidateState {
    received_votes_from: HashSet<MemberId>,
    _timer: Option<FollowerTimerHandle>,
}

/// A client write waiting to be applied.
pub(crate) struct ClientRequestTracker {
    pub(crate) index: i64,
    pub(crate) term: Term,
    pub(crate) callback: Callback<SubmitOutput, SubmitError>,
}

pub(crate) struct LeaderState {
    pub(crate) tracker: LeaderStateTracker,
    pub(crate) client_requests: VecDeque<ClientRequestTracker>,
    /// Snapshot being streamed to one or more followers.
    pub(crate) snapshot_holder: Option<Snapshot>,
    pub(crate) last_isolated_check: Instant,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, &actor_client));
        let (notifier, listener) = state_change_listener::new(ElectionStateSnapshot {
            role: RaftRole::Follower,
            term,
            leader_id: None,
        });

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn role(&self) -> RaftRole {
        match &self.state {
            State::Follower(_) | State::Stopped => RaftRole::Follower,
            State::Candidate(_) => RaftRole::Candidate,
            State::Leader(_) => RaftRole::Leader,
            State::IsolatedLeader(_) => RaftRole::IsolatedLeader,
        }
    }

    pub(crate) fn leader_id(&self) -> Option<&MemberId> {
        match &self.state {
            State::Follower(fs) => fs.leader_id.as_ref(),
            State::Leader(_) | State::IsolatedLeader(_) => Some(&self.config.my_id),
            State::Candidate(_) | State::Stopped => None,
        }
    }

    pub(crate) fn transition_to_follower(&mut self, leader_id: Option<MemberId>, term: Term) {
        self.state = State::Follower(FollowerState::new(leader_id, &self.config, &self.actor_client));
        self.notify_new_state(term);
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut cs = CandidateState {
            received_votes_from: HashSet::with_capacity(3),
            _timer: spawn_follower_timer(&self.config, &self.actor_client),
        };
        cs.received_votes_from.insert(self.config.my_id.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state(term);
    }

    pub(crate) fn transition_to_leader(&mut self, tracker: LeaderStateTracker, term: Term) {
        self.state = State::Leader(LeaderState {
            tracker,
            client_requests: VecDeque::new(),
            snapshot_holder: None,
            last_isolated_check: Instant::now(),
        });
        self.notify_new_state(term);
    }

    /// Moves between Leader and IsolatedLeader, keeping all leader state.
    pub(crate) fn set_leader_isolated(&mut self, isolated: bool, term: Term) {
        let state = std::mem::replace(&mut self.state, State::Stopped);
        self.state = match state {
            State::Leader(ls) | State::IsolatedLeader(ls) if isolated => State::IsolatedLeader(ls),
            State::Leader(ls) | State::IsolatedLeader(ls) => State::Leader(ls),
            other => other,
        };
        self.notify_new_state(term);
    }

    /// Returns the leader state of the behavior being left, if it was a leader.
    pub(crate) fn take_leader_state(&mut self) -> Option<LeaderState> {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Leader(ls) | State::IsolatedLeader(ls) => Some(ls),
            other => {
                self.state = other;
                None
            }
        }
    }

    pub(crate) fn stop(&mut self, term: Term) {
        self.state = State::Stopped;
        self.notify_new_state(term);
    }

    pub(crate) fn current_state(&self, term: Term) -> ElectionStateSnapshot {
        ElectionStateSnapshot {
            role: self.role(),
            term,
            leader_id: self.leader_id().cloned(),
        }
    }

    fn notify_new_state(&self, term: Term) {
        self.state_change_notifier.notify_new_state(self.current_state(term));
    }

    pub(crate) fn set_leader_if_follower(&mut self, leader_id: Option<MemberId>, term: Term) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader_id != leader_id {
                fs.leader_id = leader_id;
                self.notify_new_state(term);
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: MemberId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            cs.received_votes_from.insert(vote_from);
            Some(cs.received_votes_from.len())
        } else {
            None
        }
    }

    pub(crate) fn follower_mut(&mut self) -> Option<&mut FollowerState> {
        if let State::Follower(fs) = &mut self.state {
            Some(fs)
        } else {
            None
        }
    }

    pub(crate) fn leader(&self) -> Option<&LeaderState> {
        match &self.state {
            State::Leader(ls) | State::IsolatedLeader(ls) => Some(ls),
            _ => None,
        }
    }

    pub(crate) fn leader_mut(&mut self) -> Option<&mut LeaderState> {
        match &mut self.state {
            State::Leader(ls) | State::IsolatedLeader(ls) => Some(ls),
            _ => None,
        }
    }

    /// Follower tracking for a peer of a leader in `term`, with its own heartbeat timer.
    pub(crate) fn new_follower_log_information(
        &self,
        peer_id: MemberId,
        voting_state: VotingState,
        commit_index: i64,
        term: Term,
    ) -> FollowerLogInformation {
        let timer = if self.config.spawn_timers {
            Some(LeaderTimerHandle::spawn_timer_task(
                self.config.leader_heartbeat_duration,
                self.actor_client.clone(),
                peer_id.clone(),
                term,
            ))
        } else {
            None
        };
        FollowerLogInformation::new(peer_id, voting_state, commit_index, timer)
    }
}

impl FollowerState {
    fn new(leader_id: Option<MemberId>, config: &ElectionConfig, actor_client: &WeakActorClient) -> Self {
        FollowerState {
            leader_id,
            last_leader_message: None,
            snapshot_tracker: None,
            timer: spawn_follower_timer(config, actor_client),
        }
    }

    pub(crate) fn snapshot_tracker_mut(&mut self) -> &mut Option<SnapshotTracker> {
        &mut self.snapshot_tracker
    }

    pub(crate) fn has_snapshot_tracker(&self) -> bool {
        self.snapshot_tracker.is_some()
    }

    pub(crate) fn restart_last_leader_message_timer(&mut self) {
        self.last_leader_message = Some(Instant::now());
        if let Some(timer) = &self.timer {
            timer.reset_timeout();
        }
    }

    /// True if nothing came from a leader for at least `election_timeout`.
    pub(crate) fn no_leader_message_within(&self, election_timeout: Duration) -> bool {
        match self.last_leader_message {
            Some(at) => at.elapsed() >= election_timeout,
            None => true,
        }
    }
}

fn spawn_follower_timer(config: &ElectionConfig, actor_client: &WeakActorClient) -> Option<FollowerTimerHandle> {
    if config.spawn_timers {
        Some(FollowerTimerHandle::spawn_timer_task(
            config.follower_min_timeout,
            config.follower_max_timeout,
            actor_client.clone(),
        ))
    } else {
        None
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::IsolatedLeader(_) => write!(f, "IsolatedLeader"),
            State::Candidate(cs) => write!(f, "Candidate(Votes={})", cs.received_votes_from.len()),
            State::Follower(FollowerState {
                leader_id: Some(leader_id),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_id),
            State::Follower(FollowerState { leader_id: None, .. }) => write!(f, "Follower(Leader=None)"),
            State::Stopped => write!(f, "Stopped"),
        }
    }
}
