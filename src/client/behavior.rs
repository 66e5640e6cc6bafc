use crate::client::actor::ClientEvent;
use crate::client::connection::{ClientConnection, ClientContext, ConnectionState, TimerOutcome};
use crate::client::connection_map::ConnectionMap;
use crate::client::errors::{RequestError, ResolveError};
use crate::client::transmit_queue::{ConnectionEntry, ResponseCallback};
use crate::client::types::{
    BackendInfo, BackendInfoResolver, ClientIdentifier, Request, ResponseEnvelope, ShardCookie, StaleRegistration,
};
use crate::clock::Clock;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Throttling delays above this are cut short. A submitter is never parked longer.
const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(5);
const WARN_THROTTLE_DELAY: Duration = Duration::from_millis(100);

/// State reachable from both application tasks and the client actor.
pub(crate) struct ClientShared<C: Clock> {
    logger: slog::Logger,
    context: Arc<ClientContext<C>>,
    connections: ConnectionMap<ClientConnection<C>>,
    halted: Mutex<Option<RequestError>>,
    resolver: Arc<dyn BackendInfoResolver>,
    identifier: ClientIdentifier,
}

impl<C: Clock> ClientShared<C> {
    pub(crate) fn new(
        context: Arc<ClientContext<C>>,
        resolver: Arc<dyn BackendInfoResolver>,
        identifier: ClientIdentifier,
    ) -> Arc<Self> {
        Arc::new(ClientShared {
            logger: context.logger.clone(),
            context,
            connections: ConnectionMap::new(),
            halted: Mutex::new(None),
            resolver,
            identifier,
        })
    }

    pub(crate) fn identifier(&self) -> &ClientIdentifier {
        &self.identifier
    }

    fn halted_cause(&self) -> Option<RequestError> {
        self.halted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Fails every connection, and every request from now on, with `cause`.
    fn halt(&self, cause: RequestError) {
        {
            let mut halted = self.halted.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if halted.is_none() {
                *halted = Some(cause.clone());
            }
        }
        for connection in self.connections.clear() {
            connection.poison(cause.clone());
        }
    }

    /// Resolves a backend for a connecting or reconnecting connection in the background. The
    /// outcome comes back to the actor as `BackendResolved`.
    fn resolve(&self, connection: Arc<ClientConnection<C>>) {
        let resolver = self.resolver.clone();
        let mailbox = self.context.mailbox.clone();
        tokio::task::spawn(async move {
            let cookie = connection.cookie();
            let result = match connection.state() {
                ConnectionState::Reconnecting { backend, .. } => resolver.refresh_backend_info(cookie, backend).await,
                _ => resolver.get_backend_info(cookie).await,
            };
            mailbox.deliver(ClientEvent::BackendResolved { connection, result });
        });
    }
}

/// The application side of a client.
pub(crate) struct ClientHandle<C: Clock> {
    shared: Arc<ClientShared<C>>,
}

impl<C: Clock> Clone for ClientHandle<C> {
    fn clone(&self) -> Self {
        ClientHandle {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Clock> ClientHandle<C> {
    pub(crate) fn new(shared: Arc<ClientShared<C>>) -> Self {
        ClientHandle { shared }
    }

    pub(crate) fn identifier(&self) -> &ClientIdentifier {
        self.shared.identifier()
    }

    /// Queues `request` on its shard's connection and waits out the throttling delay. Requests
    /// enqueued one after another by the same task are transmitted in that order.
    pub(crate) async fn enqueue_request(&self, request: Request) -> oneshot::Receiver<Result<Bytes, RequestError>> {
        let (tx, rx) = oneshot::channel();
        if let Some(cause) = self.shared.halted_cause() {
            let _ = tx.send(Err(cause));
            return rx;
        }

        let shared = &self.shared;
        let cookie = request.cookie;
        let (connection, created) = shared
            .connections
            .get_or_create(cookie, || ClientConnection::connecting(shared.context.clone(), cookie))
            .await;
        if created {
            slog::debug!(shared.logger, "Resolving backend for {}", cookie);
            shared.resolve(connection.clone());
        }

        let now = shared.context.now_ticks();
        let delay = connection.enqueue_entry(ConnectionEntry::new(request, ResponseCallback::new(tx), now), now);
        self.throttle(Duration::from_nanos(delay)).await;
        rx
    }

    pub(crate) async fn send_request(&self, request: Request) -> Result<Bytes, RequestError> {
        let response = self.enqueue_request(request).await;
        response.await.unwrap_or(Err(RequestError::Closed))
    }

    async fn throttle(&self, delay: Duration) {
        if delay == Duration::from_secs(0) {
            return;
        }
        let delay = delay.min(MAX_THROTTLE_DELAY);
        if delay >= WARN_THROTTLE_DELAY {
            slog::warn!(self.shared.logger, "Request submission throttled for {:?}", delay);
        }
        let mut clock = self.shared.context.clock.clone();
        clock.sleep(delay).await;
    }

    pub(crate) fn deliver_response(&self, response: ResponseEnvelope) {
        self.shared.context.mailbox.deliver(ClientEvent::Response(response));
    }
}

/// ClientBehavior runs on the client actor. It is the only place connections get replaced.
pub(crate) struct ClientBehavior<C: Clock> {
    logger: slog::Logger,
    shared: Arc<ClientShared<C>>,
    stale_registration: StaleRegistration,
    stopped: bool,
}

impl<C: Clock> ClientBehavior<C> {
    pub(crate) fn new(shared: Arc<ClientShared<C>>) -> Self {
        let mailbox = shared.context.mailbox.clone();
        let stale_registration = shared
            .resolver
            .notify_when_backend_info_is_stale(Arc::new(move |cookie: ShardCookie| {
                mailbox.deliver(ClientEvent::BackendStale(cookie));
            }));

        ClientBehavior {
            logger: shared.logger.clone(),
            shared,
            stale_registration,
            stopped: false,
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn handle_event(&mut self, event: ClientEvent<C>) {
        match event {
            ClientEvent::Response(response) => self.on_response(response),
            ClientEvent::BackendResolved { connection, result } => self.backend_connect_finished(connection, result),
            ClientEvent::RetryResolve(connection) => {
                if self.shared.connections.is_current(connection.cookie(), &connection) {
                    self.shared.resolve(connection);
                }
            }
            ClientEvent::ConnectionTimer(connection) => {
                if let Some(connection) = connection.upgrade() {
                    self.on_connection_timer(connection);
                }
            }
            ClientEvent::BackendStale(cookie) => self.on_backend_stale(cookie),
            ClientEvent::Shutdown(done) => {
                self.stop();
                let _ = done.send(());
            }
        }
    }

    /// Fails everything still queued. Idempotent.
    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        slog::info!(self.logger, "Client {:?} shutting down", self.shared.identifier);
        self.stopped = true;
        self.stale_registration.close();
        self.shared.halt(RequestError::Closed);
    }

    fn on_response(&mut self, response: ResponseEnvelope) {
        let connection = match self.shared.connections.get(response.cookie) {
            Some(connection) => connection,
            None => {
                slog::debug!(self.logger, "No connection for {}, dropping response", response.cookie);
                return;
            }
        };

        match &response.result {
            Err(cause @ RequestError::RetiredGeneration { .. }) => {
                slog::error!(self.logger, "Client generation retired, halting: {}", cause);
                self.shared.halt(cause.clone());
                return;
            }
            Err(cause @ RequestError::NotLeader { .. }) | Err(cause @ RequestError::OutOfSequence { .. }) => {
                match connection.state() {
                    ConnectionState::Connected { backend } if backend.session_id == response.session_id => {
                        slog::info!(self.logger, "Connection to {} failed: {}", backend.name, cause);
                        self.reconnect(&connection, cause.clone());
                    }
                    ConnectionState::Reconnecting { .. } => {
                        slog::debug!(self.logger, "Already reconnecting, ignoring {}", cause);
                    }
                    _ => {
                        slog::debug!(self.logger, "Ignoring {} from session {}", cause, response.session_id);
                    }
                }
                return;
            }
            _ => {}
        }

        connection.receive_response(response);
    }

    fn on_connection_timer(&mut self, connection: Arc<ClientConnection<C>>) {
        match connection.run_timer() {
            TimerOutcome::Nothing => {}
            TimerOutcome::Reconnect(cause) => self.reconnect(&connection, cause),
            TimerOutcome::Poisoned => {
                self.shared.connections.remove(connection.cookie(), &connection);
            }
        }
    }

    fn on_backend_stale(&mut self, cookie: ShardCookie) {
        let connection = match self.shared.connections.get(cookie) {
            Some(connection) => connection,
            None => return,
        };
        if let ConnectionState::Connected { backend } = connection.state() {
            let cause = RequestError::StaleBackend {
                backend: backend.name.clone(),
            };
            slog::info!(self.logger, "Backend for {} is stale", cookie);
            self.reconnect(&connection, cause);
        }
    }

    /// Replaces a connected connection with a reconnecting one, which resolves a new backend.
    fn reconnect(&mut self, connection: &Arc<ClientConnection<C>>, cause: RequestError) {
        let cookie = connection.cookie();
        match connection.state() {
            ConnectionState::Connecting => {
                slog::debug!(self.logger, "{} still resolving, ignoring {}", cookie, cause);
            }
            ConnectionState::Reconnecting { .. } => connection.add_suppressed(cause),
            ConnectionState::Connected { backend } => {
                if !self.shared.connections.is_current(cookie, connection) {
                    slog::debug!(self.logger, "{} was already replaced", cookie);
                    return;
                }

                slog::info!(self.logger, "Reconnecting {} away from {}", cookie, backend.name);
                let successor = ClientConnection::reconnecting(connection, backend.clone(), cause);
                connection.set_forwarder(successor.clone());
                self.shared.connections.replace(cookie, connection, successor.clone());
                self.shared.resolve(successor);
            }
        }
    }

    fn backend_connect_finished(
        &mut self,
        connection: Arc<ClientConnection<C>>,
        result: Result<BackendInfo, ResolveError>,
    ) {
        let cookie = connection.cookie();
        if !self.shared.connections.is_current(cookie, &connection) {
            slog::debug!(self.logger, "Resolution for a superseded {} connection, ignoring", cookie);
            return;
        }

        match result {
            Ok(backend) => {
                slog::info!(self.logger, "Resolved {} to {}", cookie, backend.name);
                let successor = ClientConnection::connected(&connection, backend);
                let mut replay = connection.start_replay();
                let now = self.shared.context.now_ticks();
                for entry in replay.take_entries() {
                    successor.replay_entry(entry, now);
                }
                self.shared.connections.replace(cookie, &connection, successor.clone());
                connection.finish_replay(replay, successor);
            }
            Err(ResolveError::Timeout) => {
                let retry = self.shared.context.options.resolve_retry;
                slog::warn!(self.logger, "Timed out resolving {}, retrying in {:?}", cookie, retry);
                let mut clock = self.shared.context.clock.clone();
                let wake_at = clock.now() + retry;
                let mailbox = self.shared.context.mailbox.clone();
                tokio::task::spawn(async move {
                    clock.sleep_until(wake_at).await;
                    mailbox.deliver(ClientEvent::RetryResolve(connection));
                });
            }
            Err(ResolveError::Request(cause)) => {
                slog::error!(self.logger, "Resolving {} failed: {}", cookie, cause);
                connection.poison(cause);
                self.shared.connections.remove(cookie, &connection);
            }
            Err(ResolveError::Other(message)) => {
                slog::error!(self.logger, "Resolving {} failed: {}", cookie, message);
                let cause = connection.give_up_cause(format!("Failed to resolve {}: {}", cookie, message));
                connection.poison(cause);
                self.shared.connections.remove(cookie, &connection);
            }
        }
    }
}
