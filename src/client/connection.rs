use crate::client::actor::{ClientEvent, ClientMailbox};
use crate::client::errors::RequestError;
use crate::client::options::ClientOptionsValidated;
use crate::client::progress_tracker::AveragingProgressTracker;
use crate::client::transmit_queue::{ConnectionEntry, ReconnectForwarder, TransmitQueue};
use crate::client::types::{BackendInfo, RequestSink, ResponseEnvelope, ShardCookie};
use crate::clock::Clock;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

/// Shared by every connection of one client.
pub(crate) struct ClientContext<C: Clock> {
    pub(crate) logger: slog::Logger,
    pub(crate) clock: C,
    /// Tick zero. Trackers move between connections, so they all count from here.
    pub(crate) origin: Instant,
    pub(crate) options: ClientOptionsValidated,
    pub(crate) sink: Arc<dyn RequestSink>,
    pub(crate) mailbox: ClientMailbox<C>,
}

impl<C: Clock> ClientContext<C> {
    pub(crate) fn now_ticks(&self) -> u64 {
        self.clock.ticks_since(self.origin)
    }
}

/// A connection's state never changes. Moving to another state means replacing the connection.
#[derive(Clone, Debug)]
pub(crate) enum ConnectionState {
    /// Backend not resolved yet.
    Connecting,
    Connected { backend: BackendInfo },
    /// `backend` stopped working for `cause`, a new one is being resolved.
    Reconnecting { backend: BackendInfo, cause: RequestError },
}

pub(crate) enum TimerOutcome {
    Nothing,
    /// Backend went silent. The connection needs to be replaced.
    Reconnect(RequestError),
    /// Queue stopped making progress and failed everything.
    Poisoned,
}

enum TimeoutCheck {
    Idle,
    Next(Duration),
    BackendDead(Duration),
}

struct ConnectionInner {
    queue: TransmitQueue,
    have_timer: bool,
    last_received_ticks: u64,
    poisoned: Option<RequestError>,
    suppressed: Vec<RequestError>,
}

/// ClientConnection queues one shard's requests towards one backend incarnation.
///
/// Application tasks enqueue under `inner`'s lock, the client actor completes and replaces
/// connections. A superseded connection forwards whatever still reaches it to its successor.
pub(crate) struct ClientConnection<C: Clock> {
    context: Arc<ClientContext<C>>,
    logger: slog::Logger,
    cookie: ShardCookie,
    state: ConnectionState,
    inner: Mutex<ConnectionInner>,
}

impl<C: Clock> ClientConnection<C> {
    pub(crate) fn connecting(context: Arc<ClientContext<C>>, cookie: ShardCookie) -> Arc<Self> {
        let now = context.now_ticks();
        let tracker = AveragingProgressTracker::new(
            context.options.queue_depth,
            nanos(context.options.default_ticks_per_task),
            now,
        );
        Self::new(context, cookie, ConnectionState::Connecting, tracker, now)
    }

    pub(crate) fn connected(previous: &ClientConnection<C>, backend: BackendInfo) -> Arc<Self> {
        let now = previous.context.now_ticks();
        let mut tracker = previous.inherited_tracker(now);
        tracker.cancel_debt(now);
        Self::new(
            previous.context.clone(),
            previous.cookie,
            ConnectionState::Connected { backend },
            tracker,
            now,
        )
    }

    pub(crate) fn reconnecting(previous: &ClientConnection<C>, backend: BackendInfo, cause: RequestError) -> Arc<Self> {
        let now = previous.context.now_ticks();
        let tracker = previous.inherited_tracker(now);
        Self::new(
            previous.context.clone(),
            previous.cookie,
            ConnectionState::Reconnecting { backend, cause },
            tracker,
            now,
        )
    }

    fn new(
        context: Arc<ClientContext<C>>,
        cookie: ShardCookie,
        state: ConnectionState,
        tracker: AveragingProgressTracker,
        now: u64,
    ) -> Arc<Self> {
        let logger = context.logger.new(slog::o!("Shard" => cookie.to_string()));
        let queue = match &state {
            ConnectionState::Connected { backend } => {
                TransmitQueue::transmitting(logger.clone(), context.sink.clone(), tracker, backend.clone())
            }
            _ => TransmitQueue::halted(logger.clone(), context.sink.clone(), tracker),
        };
        slog::debug!(logger, "New connection in state {:?}", state);

        Arc::new(ClientConnection {
            context,
            logger,
            cookie,
            state,
            inner: Mutex::new(ConnectionInner {
                queue,
                have_timer: false,
                last_received_ticks: now,
                poisoned: None,
                suppressed: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inherited_tracker(&self, now: u64) -> AveragingProgressTracker {
        AveragingProgressTracker::inherit(self.lock().queue.tracker(), now)
    }

    pub(crate) fn cookie(&self) -> ShardCookie {
        self.cookie
    }

    pub(crate) fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    #[cfg(test)]
    pub(crate) fn is_poisoned(&self) -> bool {
        self.lock().poisoned.is_some()
    }

    fn backend_name(&self) -> String {
        match &self.state {
            ConnectionState::Connected { backend } | ConnectionState::Reconnecting { backend, .. } => {
                backend.name.clone()
            }
            ConnectionState::Connecting => self.cookie.to_string(),
        }
    }

    /// Queues `entry` and returns the ticks its submitter should wait. A poisoned connection fails
    /// the entry right away.
    pub(crate) fn enqueue_entry(self: &Arc<Self>, entry: ConnectionEntry, now: u64) -> u64 {
        let mut inner = self.lock();
        if let Some(cause) = &inner.poisoned {
            entry.complete(Err(cause.clone()));
            return 0;
        }
        self.arm_timer_for(&mut inner, &entry, now);
        inner.queue.enqueue_or_forward(entry, now)
    }

    /// Queues an entry carried over from a replaced connection.
    pub(crate) fn replay_entry(self: &Arc<Self>, entry: ConnectionEntry, now: u64) {
        let mut inner = self.lock();
        if let Some(cause) = &inner.poisoned {
            entry.complete(Err(cause.clone()));
            return;
        }
        self.arm_timer_for(&mut inner, &entry, now);
        inner.queue.replay_or_forward(entry, now);
    }

    fn arm_timer_for(self: &Arc<Self>, inner: &mut ConnectionInner, entry: &ConnectionEntry, now: u64) {
        if !inner.queue.is_empty() || inner.queue.has_successor() {
            return;
        }
        // Silence only counts while something is outstanding.
        inner.last_received_ticks = now;
        let deadline = entry.enqueued_ticks + nanos(self.context.options.request_timeout);
        self.schedule_timer(inner, Duration::from_nanos(deadline.saturating_sub(now)));
    }

    fn schedule_timer(self: &Arc<Self>, inner: &mut ConnectionInner, delay: Duration) {
        if inner.have_timer {
            slog::trace!(self.logger, "Timer already scheduled");
            return;
        }
        if inner.queue.has_successor() {
            slog::trace!(self.logger, "Connection has a successor, not scheduling timer");
            return;
        }

        let delay = delay.min(self.context.options.backend_aliveness_timeout);
        inner.have_timer = true;
        slog::trace!(self.logger, "Scheduling timer in {:?}", delay);

        let mut clock = self.context.clock.clone();
        let wake_at = clock.now() + delay;
        let mailbox = self.context.mailbox.clone();
        let connection = Arc::downgrade(self);
        tokio::task::spawn(async move {
            clock.sleep_until(wake_at).await;
            mailbox.deliver(ClientEvent::ConnectionTimer(connection));
        });
    }

    /// Hands `response` to the entry it answers.
    pub(crate) fn receive_response(&self, response: ResponseEnvelope) {
        let now = self.context.now_ticks();
        let entry = {
            let mut inner = self.lock();
            inner.last_received_ticks = now;
            inner.queue.complete(&response, now)
        };
        if let Some(entry) = entry {
            entry.complete(response.result);
        }
    }

    /// Runs on the client actor when this connection's timer fires.
    pub(crate) fn run_timer(self: &Arc<Self>) -> TimerOutcome {
        let now = self.context.now_ticks();
        let mut inner = self.lock();
        inner.have_timer = false;

        let stalling = inner.queue.ticks_stalling(now);
        if stalling >= nanos(self.context.options.no_progress_timeout) {
            let elapsed = Duration::from_nanos(stalling);
            slog::error!(self.logger, "Queue has not made progress in {:?}, failing all requests", elapsed);
            Self::locked_poison(&mut inner, RequestError::NoProgress { elapsed });
            return TimerOutcome::Poisoned;
        }

        match self.locked_check_timeout(&mut inner, now) {
            TimeoutCheck::Idle => TimerOutcome::Nothing,
            TimeoutCheck::Next(delay) => {
                self.schedule_timer(&mut inner, delay);
                TimerOutcome::Nothing
            }
            TimeoutCheck::BackendDead(silence) => {
                slog::info!(self.logger, "Backend {} silent for {:?}", self.backend_name(), silence);
                TimerOutcome::Reconnect(RequestError::runtime(
                    format!("Backend {} did not respond in {:?}", self.backend_name(), silence),
                    None,
                ))
            }
        }
    }

    fn locked_check_timeout(&self, inner: &mut ConnectionInner, now: u64) -> TimeoutCheck {
        if inner.queue.is_empty() {
            return TimeoutCheck::Idle;
        }

        if let ConnectionState::Connected { .. } = self.state {
            let silence = now.saturating_sub(inner.last_received_ticks);
            if silence >= nanos(self.context.options.backend_aliveness_timeout) {
                return TimeoutCheck::BackendDead(Duration::from_nanos(silence));
            }
        }

        let request_timeout = nanos(self.context.options.request_timeout);
        let mut next = None;
        while let Some(enqueued_ticks) = inner.queue.peek().map(|entry| entry.enqueued_ticks) {
            let open_for = now.saturating_sub(enqueued_ticks);
            if open_for < request_timeout {
                next = Some(request_timeout - open_for);
                break;
            }
            if let Some(entry) = inner.queue.remove_head(now) {
                slog::debug!(self.logger, "{:?} timed out after {:?}", entry, Duration::from_nanos(open_for));
                entry.complete(Err(RequestError::Timeout {
                    elapsed: Duration::from_nanos(open_for),
                    backend: self.backend_name(),
                }));
            }
        }
        inner.queue.try_transmit(now);

        match next {
            Some(ticks) => TimeoutCheck::Next(Duration::from_nanos(ticks)),
            None => TimeoutCheck::Idle,
        }
    }

    fn locked_poison(inner: &mut ConnectionInner, cause: RequestError) {
        inner.queue.poison(&cause);
        inner.poisoned = Some(cause);
    }

    /// Fails everything queued and everything submitted later with `cause`.
    pub(crate) fn poison(&self, cause: RequestError) {
        slog::debug!(self.logger, "Poisoning connection: {}", cause);
        Self::locked_poison(&mut self.lock(), cause);
    }

    /// Remembers a failure that arrived while this connection was already replacing a backend.
    pub(crate) fn add_suppressed(&self, cause: RequestError) {
        self.lock().suppressed.push(cause);
    }

    /// The failure a reconnecting connection gives up with: `message`, caused by why the
    /// reconnect started, carrying every failure seen since.
    pub(crate) fn give_up_cause(&self, message: String) -> RequestError {
        let cause = match &self.state {
            ConnectionState::Reconnecting { cause, .. } => Some(Box::new(cause.clone())),
            _ => None,
        };
        RequestError::Runtime {
            message,
            cause,
            suppressed: self.lock().suppressed.clone(),
        }
    }

    /// Makes `successor` receive everything queued here, and everything submitted here from now
    /// on.
    pub(crate) fn set_forwarder(&self, successor: Arc<ClientConnection<C>>) {
        let now = self.context.now_ticks();
        self.lock()
            .queue
            .set_forwarder(Arc::new(SuccessorForwarder(successor)), now);
    }

    /// Locks the connection and takes its entries. Until `finish_replay`, submitters wait, so
    /// nothing can slip in front of the replayed entries.
    pub(crate) fn start_replay(&self) -> ConnectionReplay<'_> {
        let mut inner = self.lock();
        let entries = inner.queue.drain();
        ConnectionReplay { inner, entries }
    }

    pub(crate) fn finish_replay(&self, mut replay: ConnectionReplay<'_>, successor: Arc<ClientConnection<C>>) {
        let now = self.context.now_ticks();
        replay
            .inner
            .queue
            .set_forwarder(Arc::new(SuccessorForwarder(successor)), now);
    }
}

pub(crate) struct ConnectionReplay<'a> {
    inner: MutexGuard<'a, ConnectionInner>,
    entries: Vec<ConnectionEntry>,
}

impl ConnectionReplay<'_> {
    pub(crate) fn take_entries(&mut self) -> Vec<ConnectionEntry> {
        std::mem::take(&mut self.entries)
    }
}

struct SuccessorForwarder<C: Clock>(Arc<ClientConnection<C>>);

impl<C: Clock> ReconnectForwarder for SuccessorForwarder<C> {
    fn forward_entry(&self, entry: ConnectionEntry, now: u64) -> u64 {
        self.0.enqueue_entry(entry, now)
    }

    fn replay_entry(&self, entry: ConnectionEntry, now: u64) {
        self.0.replay_entry(entry, now);
    }
}

fn nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::options::ClientOptions;
    use crate::client::testing::{backend, request, test_logger, RecordingSink};
    use crate::client::transmit_queue::ResponseCallback;
    use crate::clock::mocked_clock;
    use bytes::Bytes;
    use std::convert::TryFrom;
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test]
    async fn replay_moves_entries_to_successor_in_order() {
        let (clock, _controller) = mocked_clock();
        let (tx, _rx) = mpsc::channel(16);
        let sink = Arc::new(RecordingSink::default());
        let context = Arc::new(ClientContext {
            logger: test_logger(),
            origin: clock.now(),
            clock,
            options: ClientOptionsValidated::try_from(ClientOptions::default()).unwrap(),
            sink: sink.clone(),
            mailbox: ClientMailbox::new(tx.downgrade()),
        });

        let connecting = ClientConnection::connecting(context, ShardCookie::new(0));
        let mut receivers = Vec::new();
        for sequence in 0..3 {
            let (tx, rx) = oneshot::channel();
            connecting.enqueue_entry(ConnectionEntry::new(request(1, sequence), ResponseCallback::new(tx), 0), 0);
            receivers.push(rx);
        }
        assert!(sink.sent().is_empty());

        let connected = ClientConnection::connected(&connecting, backend("leader", 3, 10));
        let mut replay = connecting.start_replay();
        for entry in replay.take_entries() {
            connected.replay_entry(entry, 0);
        }
        connecting.finish_replay(replay, connected.clone());
        assert_eq!(sink.sent_sequences(), vec![0, 1, 2]);

        let (late_tx, _late_rx) = oneshot::channel();
        connecting.enqueue_entry(ConnectionEntry::new(request(1, 3), ResponseCallback::new(late_tx), 0), 0);
        assert_eq!(sink.sent_sequences(), vec![0, 1, 2, 3]);
        assert_eq!(connecting.queue_len(), 0);
        assert_eq!(connected.queue_len(), 4);

        let (_, first) = sink.sent()[0].clone();
        connected.receive_response(ResponseEnvelope::success(&first, Bytes::from("done")));
        assert_eq!(receivers.remove(0).await.unwrap(), Ok(Bytes::from("done")));
    }
}
