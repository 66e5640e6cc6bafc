use crate::client::errors::RequestError;
use crate::client::progress_tracker::AveragingProgressTracker;
use crate::client::types::{BackendInfo, Request, RequestEnvelope, RequestSink, ResponseEnvelope};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Completes the application's request.
pub(crate) struct ResponseCallback(oneshot::Sender<Result<Bytes, RequestError>>);

impl ResponseCallback {
    pub(crate) fn new(sender: oneshot::Sender<Result<Bytes, RequestError>>) -> Self {
        ResponseCallback(sender)
    }
}

/// A request waiting in a queue, not yet transmitted or transmitted to a backend that is gone.
pub(crate) struct ConnectionEntry {
    pub(crate) request: Request,
    callback: ResponseCallback,
    pub(crate) enqueued_ticks: u64,
}

impl ConnectionEntry {
    pub(crate) fn new(request: Request, callback: ResponseCallback, enqueued_ticks: u64) -> Self {
        ConnectionEntry {
            request,
            callback,
            enqueued_ticks,
        }
    }

    pub(crate) fn complete(self, result: Result<Bytes, RequestError>) {
        let _ = self.callback.0.send(result);
    }

    fn matches(&self, response: &ResponseEnvelope) -> bool {
        self.request.target == response.target && self.request.sequence == response.sequence
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("target", &self.request.target)
            .field("sequence", &self.request.sequence)
            .field("enqueued_ticks", &self.enqueued_ticks)
            .finish()
    }
}

struct TransmittedConnectionEntry {
    entry: ConnectionEntry,
    session_id: u64,
    tx_sequence: u64,
    tx_ticks: u64,
}

/// Where a superseded queue sends its entries.
pub(crate) trait ReconnectForwarder: Send + Sync {
    /// An entry submitted after the queue was superseded. Returns the delay the submitter should
    /// observe.
    fn forward_entry(&self, entry: ConnectionEntry, now: u64) -> u64;

    /// An entry that was already queued when the queue was superseded.
    fn replay_entry(&self, entry: ConnectionEntry, now: u64);
}

enum QueueMode {
    /// No backend. Entries accumulate and are never transmitted.
    Halted,
    Transmitting { backend: BackendInfo, next_tx_sequence: u64 },
}

/// TransmitQueue holds a connection's requests: `pending` were never sent, `inflight` were sent
/// in order and wait for responses. An entry sits in at most one of them.
pub(crate) struct TransmitQueue {
    logger: slog::Logger,
    mode: QueueMode,
    sink: Arc<dyn RequestSink>,
    pending: VecDeque<ConnectionEntry>,
    inflight: VecDeque<TransmittedConnectionEntry>,
    tracker: AveragingProgressTracker,
    successor: Option<Arc<dyn ReconnectForwarder>>,
}

impl TransmitQueue {
    pub(crate) fn halted(logger: slog::Logger, sink: Arc<dyn RequestSink>, tracker: AveragingProgressTracker) -> Self {
        Self::new(logger, QueueMode::Halted, sink, tracker)
    }

    pub(crate) fn transmitting(
        logger: slog::Logger,
        sink: Arc<dyn RequestSink>,
        tracker: AveragingProgressTracker,
        backend: BackendInfo,
    ) -> Self {
        let mode = QueueMode::Transmitting {
            backend,
            next_tx_sequence: 0,
        };
        Self::new(logger, mode, sink, tracker)
    }

    fn new(logger: slog::Logger, mode: QueueMode, sink: Arc<dyn RequestSink>, tracker: AveragingProgressTracker) -> Self {
        TransmitQueue {
            logger,
            mode,
            sink,
            pending: VecDeque::new(),
            inflight: VecDeque::new(),
            tracker,
            successor: None,
        }
    }

    pub(crate) fn tracker(&self) -> &AveragingProgressTracker {
        &self.tracker
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.inflight.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len() + self.inflight.len()
    }

    #[cfg(test)]
    pub(crate) fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub(crate) fn has_successor(&self) -> bool {
        self.successor.is_some()
    }

    pub(crate) fn ticks_stalling(&self, now: u64) -> u64 {
        self.tracker.ticks_stalling(now)
    }

    fn can_transmit_count(&self, inflight_size: usize) -> usize {
        match &self.mode {
            QueueMode::Halted => 0,
            QueueMode::Transmitting { backend, .. } => backend.max_messages.saturating_sub(inflight_size),
        }
    }

    /// Returns the delay the submitter should observe before submitting more.
    pub(crate) fn enqueue_or_forward(&mut self, entry: ConnectionEntry, now: u64) -> u64 {
        match &self.successor {
            Some(successor) => {
                slog::trace!(self.logger, "Forwarding {:?} to successor", entry);
                successor.forward_entry(entry, now)
            }
            None => self.enqueue(entry, now),
        }
    }

    pub(crate) fn enqueue(&mut self, entry: ConnectionEntry, now: u64) -> u64 {
        let delay = self.tracker.open_task(now);
        self.transmit_or_queue(entry, now);
        delay
    }

    /// Takes an entry carried over from a superseded queue. Replays are never throttled.
    pub(crate) fn replay_or_forward(&mut self, entry: ConnectionEntry, now: u64) {
        match &self.successor {
            Some(successor) => successor.replay_entry(entry, now),
            None => {
                self.tracker.open_task_without_throttle(now);
                self.transmit_or_queue(entry, now);
            }
        }
    }

    fn transmit_or_queue(&mut self, entry: ConnectionEntry, now: u64) {
        if self.pending.is_empty() && self.can_transmit_count(self.inflight.len()) > 0 {
            self.transmit(entry, now);
        } else {
            self.pending.push_back(entry);
        }
    }

    /// Moves pending entries in order while the backend has room for them.
    pub(crate) fn try_transmit(&mut self, now: u64) {
        let mut count = self.can_transmit_count(self.inflight.len());
        while count > 0 {
            match self.pending.pop_front() {
                Some(entry) => self.transmit(entry, now),
                None => return,
            }
            count -= 1;
        }
    }

    fn transmit(&mut self, entry: ConnectionEntry, now: u64) {
        let (backend, next_tx_sequence) = match &mut self.mode {
            QueueMode::Transmitting {
                backend,
                next_tx_sequence,
            } => (backend, next_tx_sequence),
            QueueMode::Halted => {
                self.pending.push_back(entry);
                return;
            }
        };

        let tx_sequence = *next_tx_sequence;
        *next_tx_sequence += 1;
        slog::trace!(self.logger, "Transmitting {:?} to {} as {}", entry, backend.name, tx_sequence);
        self.sink.send(
            backend,
            RequestEnvelope {
                request: entry.request.clone(),
                session_id: backend.session_id,
                tx_sequence,
            },
        );
        self.inflight.push_back(TransmittedConnectionEntry {
            entry,
            session_id: backend.session_id,
            tx_sequence,
            tx_ticks: now,
        });
    }

    /// Finds and removes the entry `response` answers. Only transmitted entries complete, and only
    /// when the response carries the session and transmit sequence they went out with. Anything
    /// else is a response to an earlier backend session and is dropped.
    pub(crate) fn complete(&mut self, response: &ResponseEnvelope, now: u64) -> Option<ConnectionEntry> {
        let position = match self.inflight.iter().position(|t| t.entry.request.target == response.target) {
            Some(position) => position,
            None => {
                if self.pending.iter().any(|e| e.matches(response)) {
                    slog::debug!(
                        self.logger,
                        "Dropping response for target {} sequence {}, entry was not transmitted",
                        response.target,
                        response.sequence
                    );
                } else {
                    slog::debug!(
                        self.logger,
                        "No entry for response target {} sequence {}",
                        response.target,
                        response.sequence
                    );
                }
                return None;
            }
        };

        let candidate = &self.inflight[position];
        if !candidate.entry.matches(response) {
            slog::warn!(
                self.logger,
                "Response for target {} has sequence {}, expected {:?}, ignoring",
                response.target,
                response.sequence,
                candidate.entry
            );
            return None;
        }
        if candidate.session_id != response.session_id {
            slog::warn!(
                self.logger,
                "Response for {:?} from session {} does not match transmitted session {}, ignoring",
                candidate.entry,
                response.session_id,
                candidate.session_id
            );
            return None;
        }
        if candidate.tx_sequence != response.tx_sequence {
            slog::warn!(
                self.logger,
                "Response for {:?} has tx sequence {}, transmitted as {}, ignoring",
                candidate.entry,
                response.tx_sequence,
                candidate.tx_sequence
            );
            return None;
        }

        let transmitted = self.inflight.remove(position)?;
        self.tracker.close_task(
            now,
            transmitted.entry.enqueued_ticks,
            transmitted.tx_ticks,
            response.execution_nanos,
        );
        // A slot freed up.
        self.try_transmit(now);
        Some(transmitted.entry)
    }

    /// Oldest entry still queued.
    pub(crate) fn peek(&self) -> Option<&ConnectionEntry> {
        self.inflight
            .front()
            .map(|t| &t.entry)
            .or_else(|| self.pending.front())
    }

    /// Removes the oldest entry, counting it as closed.
    pub(crate) fn remove_head(&mut self, now: u64) -> Option<ConnectionEntry> {
        match self.inflight.pop_front() {
            Some(transmitted) => {
                self.tracker
                    .close_task(now, transmitted.entry.enqueued_ticks, transmitted.tx_ticks, 0);
                Some(transmitted.entry)
            }
            None => {
                let entry = self.pending.pop_front()?;
                self.tracker.close_task(now, entry.enqueued_ticks, 0, 0);
                Some(entry)
            }
        }
    }

    /// Removes every entry, inflight first, in the order they were queued.
    pub(crate) fn drain(&mut self) -> Vec<ConnectionEntry> {
        let mut entries: Vec<ConnectionEntry> = self.inflight.drain(..).map(|t| t.entry).collect();
        entries.extend(self.pending.drain(..));
        entries
    }

    /// Hands every entry to `successor` and forwards everything submitted from now on.
    ///
    /// # Panics
    ///
    /// If a successor was already set.
    pub(crate) fn set_forwarder(&mut self, successor: Arc<dyn ReconnectForwarder>, now: u64) {
        assert!(self.successor.is_none(), "Queue already has a successor");
        slog::debug!(self.logger, "Queue superseded, splicing {} entries", self.len());
        for entry in self.drain() {
            successor.replay_entry(entry, now);
        }
        self.successor = Some(successor);
    }

    /// Fails every entry with `cause`.
    pub(crate) fn poison(&mut self, cause: &RequestError) {
        for entry in self.drain() {
            entry.complete(Err(cause.clone()));
        }
    }
}
