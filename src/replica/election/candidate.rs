use crate::actor::Event;
use crate::replica::messages::{RaftMessage, RequestVote, RequestVoteReply};
use crate::replica::peers::majority_vote_count;
use crate::replica::replica::Replica;

impl Replica {
    pub(crate) fn become_candidate(&mut self) {
        // > On conversion to candidate, start election:
        // > * Increment currentTerm
        // > * Vote for self
        let new_term = self.ctx.current_term().next();
        let my_id = self.ctx.my_id.clone();
        if self.ctx.persist_term(new_term, Some(my_id.clone())).is_err() {
            return;
        }
        // > * Reset election timer
        self.election.transition_to_candidate_and_vote_for_self(new_term);

        let voting_peers = self.ctx.peers.voting_peer_ids();
        slog::info!(
            self.ctx.logger,
            "Starting election for term {:?} with {} voting peers",
            new_term,
            voting_peers.len()
        );
        if voting_peers.is_empty() {
            // Nobody to ask. Our own vote is a majority on the next timeout.
            self.ctx.actor_client.deliver(Event::FollowerTimeout);
            return;
        }

        // > * Send RequestVote RPCs to all other servers
        let request = RequestVote {
            term: new_term,
            candidate_id: my_id,
            last_log_index: self.ctx.log.last_index(),
            last_log_term: self.ctx.log.last_term(),
        };
        for peer_id in voting_peers {
            self.ctx.send(&peer_id, RaftMessage::RequestVote(request.clone()));
        }
    }

    pub(crate) fn candidate_handle_election_timeout(&mut self) {
        if !self.ctx.can_start_election() {
            slog::info!(self.ctx.logger, "No longer allowed to elect, becoming follower");
            self.become_follower(None);
            return;
        }

        if majority_vote_count(self.ctx.peers.voting_peer_count()) == 0 {
            self.become_leader();
        } else {
            // > If election timeout elapses: start new election
            self.become_candidate();
        }
    }

    pub(crate) fn candidate_handle_request_vote_reply(&mut self, reply: RequestVoteReply) {
        let current_term = self.ctx.current_term();
        if reply.term != current_term || !reply.vote_granted {
            slog::debug!(
                self.ctx.logger,
                "Vote from {} in term {:?} not counted (granted: {})",
                reply.voter_id,
                reply.term,
                reply.vote_granted
            );
            return;
        }

        let votes = match self.election.add_vote_if_candidate(reply.voter_id) {
            Some(votes) => votes,
            None => return,
        };
        let needed = majority_vote_count(self.ctx.peers.voting_peer_count());
        slog::debug!(self.ctx.logger, "Have {} of {} votes needed in term {:?}", votes, needed, current_term);

        // > If votes received from majority of servers: become leader
        if votes >= needed {
            self.become_leader();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::replica::messages::{RaftMessage, RequestVoteReply};
    use crate::replica::test_harness::TestCluster;
    use crate::replica::{MemberId, RaftRole, Term};

    #[tokio::test]
    async fn stale_and_denied_votes_do_not_count() {
        let mut cluster = TestCluster::new(&["a", "b", "c", "d", "e"]);
        cluster.start();
        cluster.transport.isolate(&MemberId::new("a"));
        cluster.trigger_election("a");
        cluster.settle().await;
        assert_eq!(cluster.state("a").role, RaftRole::Candidate);
        assert_eq!(cluster.state("a").term, Term::new(1));

        for (voter, term, granted) in [("b", 0, true), ("c", 1, false), ("d", 1, true)] {
            cluster.deliver(
                "a",
                RaftMessage::RequestVoteReply(RequestVoteReply {
                    term: Term::new(term),
                    voter_id: MemberId::new(voter),
                    vote_granted: granted,
                }),
            );
        }
        cluster.settle().await;
        // Self plus d is two of the three needed.
        assert_eq!(cluster.state("a").role, RaftRole::Candidate);

        cluster.deliver(
            "a",
            RaftMessage::RequestVoteReply(RequestVoteReply {
                term: Term::new(1),
                voter_id: MemberId::new("e"),
                vote_granted: true,
            }),
        );
        cluster.settle().await;
        assert_eq!(cluster.state("a").role, RaftRole::Leader);
    }

    #[tokio::test]
    async fn timed_out_candidate_starts_a_new_term() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.transport.isolate(&MemberId::new("a"));
        cluster.trigger_election("a");
        cluster.settle().await;

        cluster.replica_mut("a").follower_timeout();
        cluster.settle().await;
        let state = cluster.state("a");
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.term, Term::new(2));
        assert_eq!(state.voted_for, Some(MemberId::new("a")));
    }
}
