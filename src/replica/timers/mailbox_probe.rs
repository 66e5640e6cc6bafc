use crate::actor::Event;
use crate::replica::timers::TimeoutKind;
use crate::replica::LeaderTimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

const SETTLE_YIELDS: usize = 16;

/// Reads the replica mailbox in timer tests. Time in these tests is mocked, and tests run on the
/// current thread runtime, so yielding a few times lets every woken timer task post its event.
pub(crate) struct MailboxProbe {
    receiver: mpsc::Receiver<Event>,
}

impl MailboxProbe {
    pub(crate) fn new(receiver: mpsc::Receiver<Event>) -> Self {
        MailboxProbe { receiver }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.receiver.recv())
            .await
            .expect("Nothing posted to the mailbox")
            .expect("Mailbox closed")
    }

    pub(crate) async fn expect_nothing(&mut self) {
        for _ in 0..SETTLE_YIELDS {
            tokio::task::yield_now().await;
        }
        if let Ok(event) = self.receiver.try_recv() {
            panic!("Expected an empty mailbox, got {:?}", event);
        }
    }

    pub(crate) async fn expect_follower_timeout(&mut self) {
        match self.next().await {
            Event::FollowerTimeout => {}
            other => panic!("Expected a follower timeout, got {:?}", other),
        }
    }

    pub(crate) async fn expect_leader_tick(&mut self, expected: LeaderTimerTick) {
        match self.next().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            other => panic!("Expected a leader tick, got {:?}", other),
        }
    }

    pub(crate) async fn expect_timeout(&mut self, expected: TimeoutKind) {
        match self.next().await {
            Event::Timeout(kind) => assert_eq!(kind, expected),
            other => panic!("Expected a scheduled timeout, got {:?}", other),
        }
    }
}
