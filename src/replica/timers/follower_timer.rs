use crate::actor;
use crate::clock::{Clock, RealClock};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// FollowerTimerHandle owns the election timeout of a follower or candidate. Every reset moves the
/// deadline out by a fresh random duration. Dropping the handle stops the timer task.
pub(crate) struct FollowerTimerHandle<C: Clock = RealClock> {
    deadline: watch::Sender<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        Self::spawn_with_clock(min_timeout, max_timeout, actor_client, RealClock)
    }
}

impl<C: Clock> FollowerTimerHandle<C> {
    fn spawn_with_clock(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> Self {
        let timeout_range = min_timeout..=max_timeout;
        let first_deadline = clock.now() + jitter(&timeout_range);
        let (deadline, deadline_rx) = watch::channel(first_deadline);

        tokio::task::spawn(run_election_timer(deadline_rx, actor_client, clock.clone(), min_timeout));

        FollowerTimerHandle {
            deadline,
            timeout_range,
            clock,
        }
    }

    /// Pushes the election timeout out, e.g. after hearing from the leader.
    pub(crate) fn reset_timeout(&self) {
        let _ = self.deadline.send(self.clock.now() + jitter(&self.timeout_range));
    }
}

fn jitter(range: &RangeInclusive<Duration>) -> Duration {
    rand::thread_rng().gen_range(range.clone())
}

/// Posts `FollowerTimeout` whenever the deadline passes. Without a reset it posts again every
/// `refire_after`, since a member that stays follower (e.g. non-voting) ignores the timeout.
async fn run_election_timer<C: Clock>(
    mut deadline: watch::Receiver<Instant>,
    actor_client: actor::WeakActorClient,
    clock: C,
    refire_after: Duration,
) {
    let mut wake_at = *deadline.borrow_and_update();
    loop {
        let mut sleeper = clock.clone();
        tokio::select! {
            biased;
            changed = deadline.changed() => {
                if changed.is_err() {
                    return;
                }
                wake_at = *deadline.borrow_and_update();
            }
            _ = sleeper.sleep_until(wake_at) => {
                if actor_client.follower_timeout().await.is_err() {
                    return;
                }
                wake_at = clock.now() + refire_after;
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

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn fires_one_full_timeout_after_last_reset() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut time) = clock::mocked_clock();

        let handle = FollowerTimerHandle::spawn_with_clock(TIMEOUT, TIMEOUT, actor_client.weak(), mock_clock);
        mailbox.expect_nothing().await;

        for _ in 0..4 {
            time.advance(TIMEOUT * 3 / 4);
            handle.reset_timeout();
            mailbox.expect_nothing().await;
        }
        assert_eq!(time.elapsed_time(), TIMEOUT * 3);

        time.advance(TIMEOUT - Duration::from_nanos(1));
        mailbox.expect_nothing().await;
        time.advance(Duration::from_nanos(1));
        mailbox.expect_follower_timeout().await;
    }

    #[tokio::test]
    async fn keeps_firing_while_nobody_resets() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut time) = clock::mocked_clock();
        let _handle = FollowerTimerHandle::spawn_with_clock(TIMEOUT, TIMEOUT, actor_client.weak(), mock_clock);

        for _ in 0..3 {
            time.advance(TIMEOUT / 2);
            mailbox.expect_nothing().await;
            time.advance(TIMEOUT / 2);
            mailbox.expect_follower_timeout().await;
        }
    }

    #[tokio::test]
    async fn reset_after_firing_still_delays_the_next_timeout() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut time) = clock::mocked_clock();
        let handle = FollowerTimerHandle::spawn_with_clock(TIMEOUT, TIMEOUT, actor_client.weak(), mock_clock);

        time.advance(TIMEOUT);
        mailbox.expect_follower_timeout().await;

        // An AppendEntries queued behind the timeout resets the timer late.
        time.advance(TIMEOUT / 2);
        handle.reset_timeout();
        mailbox.expect_nothing().await;
        time.advance(TIMEOUT / 2);
        mailbox.expect_nothing().await;
        time.advance(TIMEOUT / 2);
        mailbox.expect_follower_timeout().await;
    }

    #[tokio::test]
    async fn dropping_handle_stops_the_task() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut time) = clock::mocked_clock();

        let handle = FollowerTimerHandle::spawn_with_clock(TIMEOUT, TIMEOUT, actor_client.weak(), mock_clock);
        drop(handle);
        time.advance(TIMEOUT * 3);
        mailbox.expect_nothing().await;
    }
}
