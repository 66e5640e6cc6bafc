#[cfg(test)]
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock is the only way timers and the client queue engine read or wait on time, so tests can
/// substitute [`MockClock`].
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }

    /// Monotonic nanosecond ticks relative to `origin`. Saturates at zero for instants before it.
    fn ticks_since(&self, origin: Instant) -> u64 {
        let elapsed = self.now().saturating_duration_since(origin);
        elapsed.as_nanos().min(u64::MAX as u128) as u64
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let now = Instant::now();
    let (tx, rx) = watch::channel(now);
    let sleeper = MockClock { current_time: rx };
    let controller = MockClockController {
        current_time: tx,
        time_of_instantiation: now,
    };

    (sleeper, controller)
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    current_time: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current_time.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        loop {
            if *self.current_time.borrow() >= deadline {
                return;
            }

            if self.current_time.changed().await.is_err() {
                // Controller is gone, time will never move again.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    current_time: watch::Sender<Instant>,
    time_of_instantiation: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn current_time(&self) -> Instant {
        *self.current_time.borrow()
    }

    pub(crate) fn elapsed_time(&self) -> Duration {
        self.current_time() - self.time_of_instantiation
    }

    /// Advancing by large steps makes every sleeper whose deadline lies inside the step wake up
    /// at once, late. Advance in increments smaller than what the test wants to observe.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let new_now = *self.current_time.borrow() + duration;
        let _ = self.current_time.send(new_now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn mock_clock_wakes_sleepers_in_deadline_order() {
        let step = Duration::from_millis(200);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mock_clock, mut controller) = mocked_clock();
        let start = controller.current_time();

        for n in [3u32, 1, 2] {
            let mut clock = mock_clock.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                clock.sleep_until(start + step * n).await;
                tx.send(n).expect("receiver shouldn't drop");
            });
        }

        tokio::time::timeout(Duration::from_millis(20), rx.recv())
            .await
            .expect_err("Nothing should wake before the clock moves");

        for expected in 1..=3 {
            controller.advance(step);
            assert_eq!(rx.recv().await, Some(expected));
        }
        assert_eq!(controller.elapsed_time(), step * 3);
    }

    #[tokio::test]
    async fn ticks_since_saturates_before_origin() {
        let (mock_clock, mut controller) = mocked_clock();
        let origin = controller.current_time() + Duration::from_nanos(50);

        assert_eq!(mock_clock.ticks_since(origin), 0);
        controller.advance(Duration::from_nanos(80));
        assert_eq!(mock_clock.ticks_since(origin), 30);
    }
}
