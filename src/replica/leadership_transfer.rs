use crate::actor::Callback;
use crate::replica::messages::RaftMessage;
use crate::replica::peers::MemberId;
use crate::replica::replica::{Replica, TransferFollowUp};
use crate::replica::replica_api::LeadershipTransferError;
use crate::replica::timers::{ScheduledTimeout, TimeoutKind};

/// A leader handing its role to a follower. At most one runs at a time.
pub(crate) struct LeadershipTransfer {
    transfer_id: u64,
    requested_target: Option<MemberId>,
    phase: TransferPhase,
    tried: Vec<MemberId>,
    callbacks: Vec<Callback<(), LeadershipTransferError>>,
    follow_up: TransferFollowUp,
    _timeout: ScheduledTimeout,
}

#[derive(Debug, Eq, PartialEq)]
enum TransferPhase {
    /// Waiting for a target's log to match ours.
    CatchingUp,
    /// TimeoutNow went out, waiting to hear about the new leader.
    AwaitingNewLeader { target: MemberId },
}

impl LeadershipTransfer {
    fn finish(self, result: Result<(), LeadershipTransferError>) -> TransferFollowUp {
        for callback in self.callbacks {
            callback.send(result.clone());
        }
        self.follow_up
    }
}

impl Replica {
    pub(crate) fn request_leadership(
        &mut self,
        target: Option<MemberId>,
        callback: Callback<(), LeadershipTransferError>,
    ) {
        if !self.election.role().is_leader() {
            callback.send(Err(LeadershipTransferError::NotLeader));
            return;
        }
        if let Some(target) = &target {
            let known_voter = self.ctx.peers.get(target).map_or(false, |p| p.is_voting());
            if !known_voter {
                slog::warn!(self.ctx.logger, "Leadership requested for {} which is not a voting peer", target);
                callback.send(Err(LeadershipTransferError::NotTransferred {
                    target: Some(target.clone()),
                }));
                return;
            }
        }

        self.start_leadership_transfer(target, Some(callback), TransferFollowUp::None);
    }

    pub(crate) fn start_leadership_transfer(
        &mut self,
        target: Option<MemberId>,
        callback: Option<Callback<(), LeadershipTransferError>>,
        follow_up: TransferFollowUp,
    ) {
        if let Some(transfer) = &mut self.transfer {
            slog::debug!(self.ctx.logger, "Leadership transfer already in progress, waiting on it");
            transfer.callbacks.extend(callback);
            if follow_up != TransferFollowUp::None {
                transfer.follow_up = follow_up;
            }
            return;
        }

        let transfer_id = self.next_transfer_id;
        self.next_transfer_id += 1;
        slog::info!(
            self.ctx.logger,
            "Starting leadership transfer {} to {}",
            transfer_id,
            target.as_ref().map_or("any follower", |t| t.as_str())
        );

        self.transfer = Some(LeadershipTransfer {
            transfer_id,
            requested_target: target,
            phase: TransferPhase::CatchingUp,
            tried: Vec::new(),
            callbacks: callback.into_iter().collect(),
            follow_up,
            _timeout: self.schedule_transfer_timeout(transfer_id),
        });

        let my_id = self.ctx.my_id.clone();
        for peer_id in self.ctx.peers.ids() {
            self.ctx.send(
                peer_id,
                RaftMessage::LeaderTransitioning {
                    leader_id: my_id.clone(),
                },
            );
        }
        self.send_append_entries_to_all(false);
        self.try_transfer_candidates();
    }

    fn schedule_transfer_timeout(&self, transfer_id: u64) -> ScheduledTimeout {
        ScheduledTimeout::schedule(
            self.ctx.options.operation_timeout(),
            self.ctx.actor_client.clone(),
            TimeoutKind::NewLeader { transfer_id },
        )
    }

    fn try_transfer_candidates(&mut self) {
        let candidates = match (&self.transfer, self.election.leader()) {
            (Some(transfer), Some(leader)) => match &transfer.requested_target {
                Some(target) => vec![target.clone()],
                None => leader.tracker.follower_ids(),
            },
            _ => return,
        };
        for id in candidates {
            self.transfer_on_follower_progress(&id);
        }
    }

    /// Called whenever a follower acknowledges replication while we lead.
    pub(crate) fn transfer_on_follower_progress(&mut self, follower_id: &MemberId) {
        let transfer = match &self.transfer {
            Some(transfer) if transfer.phase == TransferPhase::CatchingUp => transfer,
            _ => return,
        };
        if transfer.tried.contains(follower_id) {
            return;
        }
        if let Some(target) = &transfer.requested_target {
            if target != follower_id {
                return;
            }
        }

        let election_timeout = self.ctx.options.election_timeout();
        let last_index = self.ctx.log.last_index();
        let caught_up = match self.election.leader().and_then(|l| l.tracker.follower(follower_id)) {
            Some(follower) => {
                follower.is_voting()
                    && follower.is_follower_active(election_timeout)
                    && follower.match_index() == last_index
            }
            None => false,
        };
        if !caught_up {
            return;
        }

        slog::info!(
            self.ctx.logger,
            "Follower {} caught up to {}, sending TimeoutNow",
            follower_id,
            last_index
        );
        // The last AppendEntries carries our commit index so the new leader starts from it.
        self.send_append_entries_to_follower(follower_id, Vec::new());
        self.ctx.send(follower_id, RaftMessage::TimeoutNow);

        if let Some(transfer) = &mut self.transfer {
            transfer.tried.push(follower_id.clone());
            transfer.phase = TransferPhase::AwaitingNewLeader {
                target: follower_id.clone(),
            };
        }
    }

    pub(crate) fn transfer_on_new_leader(&mut self, leader_id: &MemberId) {
        if leader_id == &self.ctx.my_id || self.transfer.is_none() {
            return;
        }
        slog::info!(self.ctx.logger, "Leadership transferred to {}", leader_id);
        self.finish_leadership_transfer(Ok(()));
    }

    pub(crate) fn transfer_on_timeout(&mut self, transfer_id: u64) {
        let transfer = match &self.transfer {
            Some(transfer) if transfer.transfer_id == transfer_id => transfer,
            _ => return,
        };

        let retry = transfer.requested_target.is_none()
            && self.election.role().is_leader()
            && self.election.leader().map_or(false, |leader| {
                leader
                    .tracker
                    .followers()
                    .any(|f| f.is_voting() && !transfer.tried.contains(f.id()))
            });

        if !retry {
            slog::warn!(self.ctx.logger, "Leadership transfer {} timed out", transfer_id);
            let target = transfer.requested_target.clone().or_else(|| match &transfer.phase {
                TransferPhase::AwaitingNewLeader { target } => Some(target.clone()),
                TransferPhase::CatchingUp => None,
            });
            self.finish_leadership_transfer(Err(LeadershipTransferError::NotTransferred { target }));
            return;
        }

        let new_id = self.next_transfer_id;
        self.next_transfer_id += 1;
        let timeout = self.schedule_transfer_timeout(new_id);
        if let Some(transfer) = &mut self.transfer {
            slog::info!(
                self.ctx.logger,
                "No new leader after transfer {}, trying another follower as {}",
                transfer_id,
                new_id
            );
            transfer.transfer_id = new_id;
            transfer.phase = TransferPhase::CatchingUp;
            transfer._timeout = timeout;
        }
        self.send_append_entries_to_all(false);
        self.try_transfer_candidates();
    }

    /// Fails an in-flight transfer without running its follow-up.
    pub(crate) fn abort_leadership_transfer(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            slog::debug!(self.ctx.logger, "Aborting leadership transfer {}", transfer.transfer_id);
            let target = transfer.requested_target.clone();
            transfer.finish(Err(LeadershipTransferError::NotTransferred { target }));
        }
    }

    fn finish_leadership_transfer(&mut self, result: Result<(), LeadershipTransferError>) {
        let transfer = match self.transfer.take() {
            Some(transfer) => transfer,
            None => return,
        };

        match transfer.finish(result) {
            TransferFollowUp::None => {}
            TransferFollowUp::StepDown => {
                if self.election.role().is_leader() {
                    slog::info!(self.ctx.logger, "Stepping down after leadership transfer");
                    self.become_follower(None);
                }
            }
            TransferFollowUp::Shutdown => self.finish_shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::actor::Callback;
    use crate::replica::test_harness::TestCluster;
    use crate::replica::{LeadershipTransferError, MemberId, RaftRole, TimeoutKind};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn leadership_moves_to_the_requested_follower() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.submit("a", "before").await.unwrap();

        let (tx, rx) = oneshot::channel();
        cluster
            .replica_mut("a")
            .request_leadership(Some(MemberId::new("c")), Callback::new(tx));
        cluster.settle().await;

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(cluster.state("c").role, RaftRole::Leader);
        let a = cluster.state("a");
        assert_eq!(a.role, RaftRole::Follower);
        assert_eq!(a.leader_id, Some(MemberId::new("c")));
    }

    #[tokio::test]
    async fn follower_cannot_transfer_leadership() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;

        let (tx, rx) = oneshot::channel();
        cluster.replica_mut("b").request_leadership(None, Callback::new(tx));
        assert_eq!(rx.await.unwrap(), Err(LeadershipTransferError::NotLeader));
    }

    #[tokio::test]
    async fn unreachable_target_times_out_and_leader_keeps_leading() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.submit("a", "x").await.unwrap();
        cluster.transport.isolate(&MemberId::new("b"));
        cluster.submit("a", "y").await.unwrap();

        let (tx, rx) = oneshot::channel();
        cluster
            .replica_mut("a")
            .request_leadership(Some(MemberId::new("b")), Callback::new(tx));
        cluster.settle().await;

        cluster
            .replica_mut("a")
            .handle_timeout(TimeoutKind::NewLeader { transfer_id: 0 });
        assert_eq!(
            rx.await.unwrap(),
            Err(LeadershipTransferError::NotTransferred {
                target: Some(MemberId::new("b"))
            })
        );
        assert_eq!(cluster.state("a").role, RaftRole::Leader);
        cluster.submit("a", "z").await.unwrap();
    }

    #[tokio::test]
    async fn transfer_without_target_retries_another_follower() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;

        // b looks caught up but never gets the TimeoutNow.
        cluster.transport.isolate(&MemberId::new("b"));
        let (tx, mut rx) = oneshot::channel();
        cluster.replica_mut("a").request_leadership(None, Callback::new(tx));
        cluster.settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(cluster.state("a").role, RaftRole::Leader);

        cluster
            .replica_mut("a")
            .handle_timeout(TimeoutKind::NewLeader { transfer_id: 0 });
        cluster.settle().await;

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(cluster.state("c").role, RaftRole::Leader);
    }

    #[tokio::test]
    async fn leader_hands_over_before_shutting_down() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;

        let (tx, rx) = oneshot::channel();
        cluster.replica_mut("a").shutdown(tx);
        cluster.settle().await;

        rx.await.unwrap();
        assert!(cluster.replica_mut("a").is_stopped());
        assert_eq!(cluster.state("b").role, RaftRole::Leader);
    }
}
