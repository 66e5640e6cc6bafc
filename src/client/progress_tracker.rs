//! Backpressure for a connection's request queue.
//!
//! Ticks are nanoseconds relative to the owning client's origin instant. The tracker keeps enough
//! history to estimate how long a task takes to close, and uses the number of open tasks to
//! decide how long a submitter should wait before adding one more.

/// Tracks tasks opened and closed on one connection and turns that into submission delays.
///
/// Delays grow as the number of open tasks approaches `limit`: nothing while at most half the
/// limit is open, one average task duration at three quarters, and `default_ticks_per_task` at
/// or over the limit.
#[derive(Debug, Clone)]
pub(crate) struct AveragingProgressTracker {
    limit: u64,
    default_ticks_per_task: u64,
    tasks_encountered: u64,
    tasks_closed: u64,
    last_closed: u64,
    /// Set while no task is open.
    last_idle: Option<u64>,
    elapsed_idle: u64,
    nearest_allowed: u64,
}

impl AveragingProgressTracker {
    pub(crate) fn new(limit: usize, default_ticks_per_task: u64, now: u64) -> Self {
        AveragingProgressTracker {
            limit: limit.max(1) as u64,
            default_ticks_per_task,
            tasks_encountered: 0,
            tasks_closed: 0,
            last_closed: now,
            last_idle: Some(now),
            // Everything before creation counts as idle.
            elapsed_idle: now,
            nearest_allowed: now,
        }
    }

    /// A tracker for a replacement connection. Throughput history carries over, open tasks don't:
    /// the entries that were open are replayed and opened again on the new tracker.
    pub(crate) fn inherit(old: &AveragingProgressTracker, now: u64) -> Self {
        let mut tracker = AveragingProgressTracker {
            limit: old.limit,
            default_ticks_per_task: old.default_ticks_per_task,
            tasks_encountered: old.tasks_closed,
            tasks_closed: old.tasks_closed,
            last_closed: old.last_closed,
            last_idle: old.last_idle,
            elapsed_idle: old.elapsed_idle,
            nearest_allowed: old.nearest_allowed,
        };
        if tracker.last_idle.is_none() {
            tracker.transit_to_idle(now);
        }
        tracker
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.last_idle.is_some()
    }

    pub(crate) fn has_open_tasks(&self) -> bool {
        self.tasks_encountered != self.tasks_closed
    }

    pub(crate) fn tasks_open(&self) -> u64 {
        self.tasks_encountered - self.tasks_closed
    }

    #[cfg(test)]
    pub(crate) fn tasks_closed(&self) -> u64 {
        self.tasks_closed
    }

    #[cfg(test)]
    pub(crate) fn limit(&self) -> u64 {
        self.limit
    }

    /// Ticks spent with at least one task open.
    pub(crate) fn ticks_worked(&self, now: u64) -> u64 {
        let end = self.last_idle.unwrap_or(now);
        end.saturating_sub(self.elapsed_idle)
    }

    pub(crate) fn ticks_worked_per_closed_task(&self, now: u64) -> u64 {
        if self.tasks_closed == 0 {
            return self.default_ticks_per_task;
        }
        self.ticks_worked(now) / self.tasks_closed
    }

    /// How long tasks have been open without any of them closing. Zero while idle.
    pub(crate) fn ticks_stalling(&self, now: u64) -> u64 {
        if self.is_idle() {
            0
        } else {
            now.saturating_sub(self.last_closed)
        }
    }

    /// Delay one more task should see, not counting delays already reserved by others.
    pub(crate) fn estimate_isolated_delay(&self, now: u64) -> u64 {
        let open = self.tasks_open();
        if open <= self.limit / 2 {
            return 0;
        }
        if open >= self.limit {
            return self.default_ticks_per_task;
        }

        let reserve = 1.0 - open as f64 / self.limit as f64;
        let per_task = self.ticks_worked_per_closed_task(now) as f64;
        let delay = per_task * (0.5 - reserve) / reserve;
        (delay as u64).min(self.default_ticks_per_task)
    }

    /// Opens a task and returns how long the submitter should wait before sending it.
    pub(crate) fn open_task(&mut self, now: u64) -> u64 {
        self.open_task_without_throttle(now);
        self.reserve_delay(now)
    }

    pub(crate) fn open_task_without_throttle(&mut self, now: u64) {
        if self.is_idle() {
            self.transit_from_idle(now);
        }
        self.tasks_encountered += 1;
    }

    // TODO: feed execution time into the per-task estimate once backends report it consistently.
    pub(crate) fn close_task(&mut self, now: u64, _enqueued_ticks: u64, _transmit_ticks: u64, _execution_nanos: u64) {
        if self.is_idle() {
            // Closing more than was opened. Happens when a response arrives for a replayed entry.
            return;
        }
        self.tasks_closed += 1;
        self.last_closed = now;
        if !self.has_open_tasks() {
            self.transit_to_idle(now);
        }
    }

    /// Forgets delays reserved in the future, e.g. after the queue moved to a new backend.
    pub(crate) fn cancel_debt(&mut self, now: u64) {
        self.nearest_allowed = self.nearest_allowed.min(now);
    }

    fn reserve_delay(&mut self, now: u64) -> u64 {
        let allowed = self.nearest_allowed.max(now) + self.estimate_isolated_delay(now);
        self.nearest_allowed = allowed;
        allowed - now
    }

    fn transit_to_idle(&mut self, now: u64) {
        self.last_idle = Some(now);
    }

    fn transit_from_idle(&mut self, now: u64) {
        if let Some(last_idle) = self.last_idle.take() {
            self.elapsed_idle += now.saturating_sub(last_idle);
        }
    }
}
