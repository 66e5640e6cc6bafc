use crate::client::behavior::ClientBehavior;
use crate::client::connection::ClientConnection;
use crate::client::errors::ResolveError;
use crate::client::types::{BackendInfo, ResponseEnvelope, ShardCookie};
use crate::clock::Clock;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

pub(crate) enum ClientEvent<C: Clock> {
    Response(ResponseEnvelope),
    BackendResolved {
        connection: Arc<ClientConnection<C>>,
        result: Result<BackendInfo, ResolveError>,
    },
    RetryResolve(Arc<ClientConnection<C>>),
    ConnectionTimer(Weak<ClientConnection<C>>),
    BackendStale(ShardCookie),
    Shutdown(oneshot::Sender<()>),
}

/// Posts into the client actor without keeping it alive.
pub(crate) struct ClientMailbox<C: Clock> {
    sender: mpsc::WeakSender<ClientEvent<C>>,
}

impl<C: Clock> Clone for ClientMailbox<C> {
    fn clone(&self) -> Self {
        ClientMailbox {
            sender: self.sender.clone(),
        }
    }
}

impl<C: Clock> ClientMailbox<C> {
    pub(crate) fn new(sender: mpsc::WeakSender<ClientEvent<C>>) -> Self {
        ClientMailbox { sender }
    }

    /// Posts without waiting. A full mailbox continues the send on a spawned task.
    pub(crate) fn deliver(&self, event: ClientEvent<C>) {
        let sender = match self.sender.upgrade() {
            Some(sender) => sender,
            None => return,
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tokio::task::spawn(async move {
                    let _ = sender.send(event).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// ClientActor owns connection replacement. Application tasks only ever enqueue.
pub(crate) struct ClientActor<C: Clock> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<ClientEvent<C>>,
    behavior: ClientBehavior<C>,
}

impl<C: Clock> ClientActor<C> {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<ClientEvent<C>>, behavior: ClientBehavior<C>) -> Self {
        ClientActor {
            logger,
            receiver,
            behavior,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.behavior.handle_event(event);
            if self.behavior.is_stopped() {
                break;
            }
        }
        self.behavior.stop();
        slog::info!(self.logger, "Client event loop exited");
    }

    #[cfg(test)]
    pub(crate) fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.receiver.try_recv() {
            self.behavior.handle_event(event);
            handled += 1;
        }
        handled
    }
}
