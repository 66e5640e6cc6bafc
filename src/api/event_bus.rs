use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, MemberId, RaftRole, Term};

// Only election changes are published for now. Further topics go into `RaftEvent` as they're needed.

/// An event that happened, as observed by the local raft member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    /// A role or leader change. Consuming this event type is subtle. It doesn't queue
    /// intermediate events. If there are multiple events between when application awaits the next
    /// event, those events will be clobbered into only the most recent event.
    Election(RaftElectionState),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftElectionState {
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: Option<MemberId>,
}

pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftEventListener {
            election_state_change_listener,
        }
    }

    /// `next_event()` returns the next event that this local raft member observes. `None` once
    /// the member has stopped.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.election_state_change_listener
            .next()
            .await
            .map(|election_state| RaftEvent::Election(RaftElectionState::from(election_state)))
    }

    pub fn current_election_state(&self) -> RaftElectionState {
        RaftElectionState::from(self.election_state_change_listener.current())
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for RaftElectionState {
    fn from(election_state: ElectionStateSnapshot) -> Self {
        RaftElectionState {
            role: election_state.role,
            term: election_state.term,
            leader_id: election_state.leader_id,
        }
    }
}
