use crate::replica::install_snapshot::LeaderInstallSnapshotState;
use crate::replica::timers::LeaderTimerHandle;
use crate::replica::{FollowerSummary, MemberId, VotingState};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// FollowerLogInformation is the leader's view of one follower's log.
pub(crate) struct FollowerLogInformation {
    id: MemberId,
    voting_state: VotingState,

    // > index of the next log entry to send to that server
    // -1 means the follower has nothing in common with us and needs a snapshot.
    next_index: i64,
    // > index of highest log entry known to be replicated on server
    match_index: i64,

    last_activity: Instant,
    // Commit index sent with the last AppendEntries. A follower with a stale one gets an update
    // even between heartbeats.
    sent_commit_index: i64,
    // Last next index we replicated entries from, and when. Keeps us from resending the same
    // entries before a heartbeat passed.
    last_replicated_index: i64,
    last_replicated_time: Option<Instant>,

    install_snapshot_state: Option<LeaderInstallSnapshotState>,

    // Held to send heartbeats for this peer
    leader_timer_handle: Option<LeaderTimerHandle>,
}

impl FollowerLogInformation {
    pub(crate) fn new(
        id: MemberId,
        voting_state: VotingState,
        commit_index: i64,
        leader_timer_handle: Option<LeaderTimerHandle>,
    ) -> Self {
        FollowerLogInformation {
            id,
            voting_state,
            next_index: commit_index + 1,
            match_index: -1,
            last_activity: Instant::now(),
            sent_commit_index: -1,
            last_replicated_index: -1,
            last_replicated_time: None,
            install_snapshot_state: None,
            leader_timer_handle,
        }
    }

    pub(crate) fn id(&self) -> &MemberId {
        &self.id
    }

    pub(crate) fn voting_state(&self) -> VotingState {
        self.voting_state
    }

    pub(crate) fn set_voting_state(&mut self, voting_state: VotingState) {
        self.voting_state = voting_state;
    }

    pub(crate) fn is_voting(&self) -> bool {
        self.voting_state == VotingState::Voting
    }

    pub(crate) fn next_index(&self) -> i64 {
        self.next_index
    }

    pub(crate) fn match_index(&self) -> i64 {
        self.match_index
    }

    /// Returns true if the value changed.
    pub(crate) fn set_next_index(&mut self, next_index: i64) -> bool {
        let changed = self.next_index != next_index;
        self.next_index = next_index;
        changed
    }

    /// Returns true if the value changed.
    pub(crate) fn set_match_index(&mut self, match_index: i64) -> bool {
        let changed = self.match_index != match_index;
        self.match_index = match_index;
        changed
    }

    /// Steps the next index back after a rejected AppendEntries. Jumps straight to the follower's
    /// last index if that is lower. Returns false if there is nowhere left to go.
    pub(crate) fn decr_next_index(&mut self, follower_last_index: i64) -> bool {
        if follower_last_index >= 0 && self.next_index > follower_last_index {
            self.next_index = follower_last_index;
            true
        } else if self.next_index > 0 {
            self.next_index -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_follower_active(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn time_since_last_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// A follower still waiting for its first snapshot is never active.
    pub(crate) fn is_follower_active(&self, election_timeout: Duration) -> bool {
        if self.voting_state == VotingState::VotingNotInitialized {
            return false;
        }
        self.last_activity.elapsed() < election_timeout
    }

    pub(crate) fn has_stale_commit_index(&self, commit_index: i64) -> bool {
        self.sent_commit_index != commit_index
    }

    pub(crate) fn set_sent_commit_index(&mut self, commit_index: i64) {
        self.sent_commit_index = commit_index;
    }

    /// Whether entries from `next_index` should go out now.
    pub(crate) fn ok_to_replicate(&mut self, commit_index: i64, heartbeat: Duration) -> bool {
        if self.voting_state == VotingState::VotingNotInitialized || self.install_snapshot_state.is_some() {
            return false;
        }

        let now = Instant::now();
        if self.next_index != self.last_replicated_index {
            self.last_replicated_index = self.next_index;
            self.last_replicated_time = Some(now);
            return true;
        }
        let heartbeat_passed = self
            .last_replicated_time
            .map(|at| now.saturating_duration_since(at) >= heartbeat)
            .unwrap_or(true);
        if heartbeat_passed {
            self.last_replicated_time = Some(now);
            return true;
        }
        commit_index > self.sent_commit_index
    }

    pub(crate) fn install_snapshot_state(&self) -> Option<&LeaderInstallSnapshotState> {
        self.install_snapshot_state.as_ref()
    }

    pub(crate) fn install_snapshot_state_mut(&mut self) -> Option<&mut LeaderInstallSnapshotState> {
        self.install_snapshot_state.as_mut()
    }

    /// Starts tracking an install for this follower, or returns the one already in progress.
    pub(crate) fn init_install_snapshot_state(&mut self, chunk_size: usize) -> &mut LeaderInstallSnapshotState {
        self.install_snapshot_state
            .get_or_insert_with(|| LeaderInstallSnapshotState::new(chunk_size))
    }

    pub(crate) fn clear_install_snapshot_state(&mut self) {
        self.install_snapshot_state = None;
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        if let Some(timer) = &self.leader_timer_handle {
            timer.reset_heartbeat_timer();
        }
    }

    pub(crate) fn summary(&self, election_timeout: Duration) -> FollowerSummary {
        FollowerSummary {
            id: self.id.clone(),
            next_index: self.next_index,
            match_index: self.match_index,
            is_active: self.is_follower_active(election_timeout),
            is_voting: self.is_voting(),
            time_since_last_activity: self.time_since_last_activity(),
        }
    }
}

/// LeaderStateTracker holds per-follower progress for one leadership term.
pub(crate) struct LeaderStateTracker {
    followers: HashMap<MemberId, FollowerLogInformation>,
}

impl LeaderStateTracker {
    pub(crate) fn new() -> Self {
        LeaderStateTracker {
            followers: HashMap::new(),
        }
    }

    pub(crate) fn add_follower(&mut self, follower: FollowerLogInformation) {
        self.followers.insert(follower.id().clone(), follower);
    }

    pub(crate) fn remove_follower(&mut self, id: &MemberId) -> Option<FollowerLogInformation> {
        self.followers.remove(id)
    }

    pub(crate) fn follower(&self, id: &MemberId) -> Option<&FollowerLogInformation> {
        self.followers.get(id)
    }

    pub(crate) fn follower_mut(&mut self, id: &MemberId) -> Option<&mut FollowerLogInformation> {
        self.followers.get_mut(id)
    }

    pub(crate) fn follower_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self.followers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn followers(&self) -> impl Iterator<Item = &FollowerLogInformation> {
        self.followers.values()
    }

    pub(crate) fn any_installing_snapshot(&self) -> bool {
        self.followers.values().any(|f| f.install_snapshot_state.is_some())
    }

    /// Lowest match index across followers, or `None` without followers.
    pub(crate) fn min_match_index(&self) -> Option<i64> {
        self.followers.values().map(|f| f.match_index).min()
    }

    /// Number of voting followers whose log holds `index`.
    pub(crate) fn voting_replicated_count(&self, index: i64) -> usize {
        self.followers
            .values()
            .filter(|f| f.is_voting() && f.match_index >= index)
            .count()
    }

    /// True if fewer voting followers are active than `min_isolated_peer_count`.
    pub(crate) fn is_isolated(&self, min_isolated_peer_count: usize, election_timeout: Duration) -> bool {
        let active = self
            .followers
            .values()
            .filter(|f| f.is_voting() && f.is_follower_active(election_timeout))
            .count();
        active < min_isolated_peer_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follower(id: &str, commit_index: i64) -> FollowerLogInformation {
        FollowerLogInformation::new(MemberId::new(id), VotingState::Voting, commit_index, None)
    }

    #[test]
    fn new_follower_starts_after_commit_index() {
        let info = follower("a", 4);
        assert_eq!(info.next_index(), 5);
        assert_eq!(info.match_index(), -1);
    }

    #[test]
    fn decr_next_index_jumps_to_follower_last_index() {
        let mut info = follower("a", 9);
        assert!(info.decr_next_index(3));
        assert_eq!(info.next_index(), 3);
        assert!(info.decr_next_index(3));
        assert_eq!(info.next_index(), 2);

        info.set_next_index(0);
        assert!(!info.decr_next_index(-1));
        assert_eq!(info.next_index(), 0);
    }

    #[test]
    fn ok_to_replicate_skips_repeats_within_a_heartbeat() {
        let heartbeat = Duration::from_secs(60);
        let mut info = follower("a", 0);

        assert!(info.ok_to_replicate(0, heartbeat));
        info.set_sent_commit_index(0);
        assert!(!info.ok_to_replicate(0, heartbeat));
        // A newer commit index is worth sending.
        assert!(info.ok_to_replicate(1, heartbeat));

        info.set_next_index(2);
        assert!(info.ok_to_replicate(0, heartbeat));
    }

    #[test]
    fn uninitialized_voter_is_inactive_and_not_replicated_to() {
        let mut info = FollowerLogInformation::new(MemberId::new("a"), VotingState::VotingNotInitialized, -1, None);
        assert!(!info.is_follower_active(Duration::from_secs(60)));
        assert!(!info.ok_to_replicate(0, Duration::from_millis(1)));
    }

    #[test]
    fn tracker_counts_voting_matches_and_isolation() {
        let election_timeout = Duration::from_secs(60);
        let mut tracker = LeaderStateTracker::new();
        let mut a = follower("a", -1);
        a.set_match_index(5);
        let mut b = follower("b", -1);
        b.set_match_index(3);
        let mut c = FollowerLogInformation::new(MemberId::new("c"), VotingState::NonVoting, -1, None);
        c.set_match_index(9);
        tracker.add_follower(a);
        tracker.add_follower(b);
        tracker.add_follower(c);

        assert_eq!(tracker.voting_replicated_count(4), 1);
        assert_eq!(tracker.voting_replicated_count(3), 2);
        assert_eq!(tracker.min_match_index(), Some(3));
        assert!(!tracker.is_isolated(2, election_timeout));
        assert!(tracker.is_isolated(3, election_timeout));
        assert_eq!(tracker.follower_ids(), vec![MemberId::new("a"), MemberId::new("b"), MemberId::new("c")]);
    }
}
