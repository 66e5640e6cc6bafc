use crate::actor;
use crate::clock::{Clock, RealClock};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// One-shot timeouts the replica schedules for itself. Ids are re-checked on arrival, a timeout
/// whose operation already finished is ignored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum TimeoutKind {
    /// A membership change did not reach consensus in time.
    ServerOperation { operation_id: u64 },
    /// A leadership transfer did not produce a new leader in time.
    NewLeader { transfer_id: u64 },
    /// Stop waiting for the leadership transfer that precedes shutdown.
    Shutdown,
}

/// ScheduledTimeout posts `Event::Timeout` once after a delay unless dropped first. The delay
/// counts from the call to `schedule`, not from when the task first runs.
pub(crate) struct ScheduledTimeout {
    token: CancellationToken,
}

impl ScheduledTimeout {
    pub(crate) fn schedule(delay: Duration, actor_client: actor::WeakActorClient, kind: TimeoutKind) -> Self {
        Self::schedule_with_clock(delay, actor_client, kind, RealClock)
    }

    fn schedule_with_clock<C: Clock>(
        delay: Duration,
        actor_client: actor::WeakActorClient,
        kind: TimeoutKind,
        mut clock: C,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let deadline = clock.now() + delay;

        tokio::task::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = clock.sleep_until(deadline) => {
                    if !cancelled.is_cancelled() {
                        let _ = actor_client.timeout(kind).await;
                    }
                }
            }
        });

        ScheduledTimeout { token }
    }
}

impl Drop for ScheduledTimeout {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::clock;
    use crate::replica::timers::mailbox_probe::MailboxProbe;

    #[tokio::test]
    async fn fires_once_after_delay() {
        let delay = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();
        let kind = TimeoutKind::ServerOperation { operation_id: 7 };

        let _timeout = ScheduledTimeout::schedule_with_clock(delay, strong_actor_client.weak(), kind.clone(), mock_clock);

        controller.advance(delay / 2);
        mailbox.expect_nothing().await;
        controller.advance(delay / 2);
        mailbox.expect_timeout(kind).await;
        controller.advance(delay * 3);
        mailbox.expect_nothing().await;
    }

    #[tokio::test]
    async fn delay_counts_from_scheduling() {
        let delay = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();
        let kind = TimeoutKind::Shutdown;

        // Time moves before the timer task ever runs.
        let _timeout = ScheduledTimeout::schedule_with_clock(delay, strong_actor_client.weak(), kind.clone(), mock_clock);
        controller.advance(delay);
        mailbox.expect_timeout(kind).await;
    }

    #[tokio::test]
    async fn drop_prevents_firing() {
        let delay = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut mailbox = MailboxProbe::new(rx);
        let (mock_clock, mut controller) = clock::mocked_clock();

        let dropped = ScheduledTimeout::schedule_with_clock(
            delay,
            strong_actor_client.weak(),
            TimeoutKind::NewLeader { transfer_id: 1 },
            mock_clock,
        );

        controller.advance(delay / 2);
        mailbox.expect_nothing().await;
        drop(dropped);
        controller.advance(delay * 2);
        mailbox.expect_nothing().await;
    }
}
