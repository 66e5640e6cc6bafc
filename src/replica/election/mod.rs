mod candidate;
mod election_state;
mod follower;
mod leader;
mod leader_state;
mod state_change_listener;

pub(crate) use election_state::ClientRequestTracker;
pub(crate) use election_state::ElectionConfig;
pub(crate) use election_state::ElectionState;
pub(crate) use leader_state::LeaderStateTracker;
pub(crate) use state_change_listener::ElectionStateChangeListener;
pub(crate) use state_change_listener::ElectionStateSnapshot;
