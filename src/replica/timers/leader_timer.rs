use crate::actor;
use crate::clock::{Clock, RealClock};
use crate::replica::{LeaderTimerTick, MemberId, Term};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// LeaderTimerHandle asks the leader for a heartbeat to one follower whenever nothing went to
/// that follower for a heartbeat duration. One handle per follower per term. Dropping the handle
/// stops the timer task.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    next_heartbeat: watch::Sender<Instant>,
    heartbeat_duration: Duration,
    clock: C,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: MemberId,
        term: Term,
    ) -> Self {
        Self::spawn_with_clock(heartbeat_duration, actor_client, LeaderTimerTick { peer_id, term }, RealClock)
    }
}

impl<C: Clock> LeaderTimerHandle<C> {
    fn spawn_with_clock(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        tick: LeaderTimerTick,
        clock: C,
    ) -> Self {
        // The leader broadcasts right after creating the timer, so the first tick is a full
        // heartbeat away.
        let (next_heartbeat, next_heartbeat_rx) = watch::channel(clock.now() + heartbeat_duration);
        tokio::task::spawn(run_heartbeat_timer(
            next_heartbeat_rx,
            actor_client,
            tick,
            clock.clone(),
            heartbeat_duration,
        ));

        LeaderTimerHandle {
            next_heartbeat,
            heartbeat_duration,
            clock,
        }
    }

    /// Called whenever an AppendEntries went out to this follower.
    pub(crate) fn reset_heartbeat_timer(&self) {
        let _ = self.next_heartbeat.send(self.clock.now() + self.heartbeat_duration);
    }
}

async fn run_heartbeat_timer<C: Clock>(
    mut next_heartbeat: watch::Receiver<Instant>,
    actor_client: actor::WeakActorClient,
    tick: LeaderTimerTick,
    clock: C,
    heartbeat_duration: Duration,
) {
    let mut wake_at = *next_heartbeat.borrow_and_update();
    loop {
        let mut sleeper = clock.clone();
        tokio::select! {
            biased;
            changed = next_heartbeat.changed() => {
                if changed.is_err() {
                    return;
                }
                wake_at = *next_heartbeat.borrow_and_update();
            }
            _ = sleeper.sleep_until(wake_at) => {
                if actor_client.leader_timer(tick.clone()).await.is_err() {
                    return;
                }
                // Ticks missed while asleep collapse into this one.
                wake_at = clock.now() + heartbeat_duration;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::clock;
    use crate::replica::timers::mailbox_probe::MailboxProbe;

    const HEARTBEAT: Duration = Duration::from_millis(100);

    fn tick() -> LeaderTimerTick {
        LeaderTimerTick {
            peer_id: MemberId::new("follower-2"),
            term: Term::new(4),
        }
    }

    #[tokio::test]
    async fn ticks_every_heartbeat_and_stops_on_drop() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut time) = clock::mocked_clock();

        let handle = LeaderTimerHandle::spawn_with_clock(HEARTBEAT, actor_client.weak(), tick(), mock_clock);
        mailbox.expect_nothing().await;

        for _ in 0..3 {
            time.advance(HEARTBEAT);
            mailbox.expect_leader_tick(tick()).await;
            mailbox.expect_nothing().await;
        }

        time.advance(HEARTBEAT * 4);
        mailbox.expect_leader_tick(tick()).await;
        mailbox.expect_nothing().await;

        drop(handle);
        time.advance(HEARTBEAT * 2);
        mailbox.expect_nothing().await;
    }

    #[tokio::test]
    async fn traffic_to_the_follower_postpones_the_tick() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut time) = clock::mocked_clock();
        let handle = LeaderTimerHandle::spawn_with_clock(HEARTBEAT, actor_client.weak(), tick(), mock_clock);

        for _ in 0..8 {
            time.advance(HEARTBEAT / 2);
            handle.reset_heartbeat_timer();
            mailbox.expect_nothing().await;
        }
        assert_eq!(time.elapsed_time(), HEARTBEAT * 4);

        time.advance(HEARTBEAT / 2);
        mailbox.expect_nothing().await;
        time.advance(HEARTBEAT / 2);
        mailbox.expect_leader_tick(tick()).await;
    }
}
