use crate::client::actor::{ClientActor, ClientEvent, ClientMailbox};
use crate::client::behavior::{ClientBehavior, ClientHandle, ClientShared};
use crate::client::connection::ClientContext;
use crate::client::errors::{ClientError, RequestError};
use crate::client::options::{ClientOptions, ClientOptionsValidated};
use crate::client::state_file;
use crate::client::types::{BackendInfoResolver, ClientIdentifier, Request, RequestSink, ResponseEnvelope};
use crate::clock::{Clock, RealClock};
use bytes::Bytes;
use std::convert::TryFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const MAILBOX_SIZE: usize = 1024;

pub struct ShardClientConfig {
    pub info_logger: slog::Logger,
    pub options: ClientOptions,
    pub member_name: String,
    pub client_type: String,
    /// Where the generation counter is kept across restarts. Without it every start is
    /// generation 0.
    pub state_directory: Option<PathBuf>,
    pub resolver: Arc<dyn BackendInfoResolver>,
    pub sink: Arc<dyn RequestSink>,
}

/// ShardClient sends requests to the leaders of shards, following leadership as it moves.
/// Cloning is cheap and clones share connections.
#[derive(Clone)]
pub struct ShardClient {
    handle: ClientHandle<RealClock>,
    sender: mpsc::Sender<ClientEvent<RealClock>>,
}

/// A request that has been queued. Requests queued one after another from the same task are
/// transmitted in that order.
pub struct PendingResponse {
    response: oneshot::Receiver<Result<Bytes, RequestError>>,
}

impl PendingResponse {
    pub async fn wait(self) -> Result<Bytes, RequestError> {
        self.response.await.unwrap_or(Err(RequestError::Closed))
    }
}

impl ShardClient {
    pub fn identifier(&self) -> &ClientIdentifier {
        self.handle.identifier()
    }

    pub async fn send_request(&self, request: Request) -> Result<Bytes, RequestError> {
        self.handle.send_request(request).await
    }

    pub async fn enqueue_request(&self, request: Request) -> PendingResponse {
        PendingResponse {
            response: self.handle.enqueue_request(request).await,
        }
    }

    /// Entry point for whatever receives responses from backends.
    pub fn deliver_response(&self, response: ResponseEnvelope) {
        self.handle.deliver_response(response);
    }

    /// Fails every outstanding request with `RequestError::Closed` and stops the client.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(ClientEvent::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Derives the client's generation and starts the client on a new task.
pub async fn try_create_shard_client(config: ShardClientConfig) -> Result<ShardClient, ClientError> {
    let options =
        ClientOptionsValidated::try_from(config.options).map_err(|e| ClientError::IllegalOptions(e.to_string()))?;

    let generation = match &config.state_directory {
        Some(directory) => {
            state_file::next_generation(&config.info_logger, directory, &config.member_name, &config.client_type)?
        }
        None => 0,
    };
    let identifier = ClientIdentifier {
        member_name: config.member_name,
        client_type: config.client_type,
        generation,
    };
    let logger = config.info_logger.new(slog::o!(
        "Client" => format!("{}-{}-{}", identifier.member_name, identifier.client_type, identifier.generation)
    ));

    let (sender, receiver) = mpsc::channel(MAILBOX_SIZE);
    let clock = RealClock;
    let context = Arc::new(ClientContext {
        logger: logger.clone(),
        origin: clock.now(),
        clock,
        options,
        sink: config.sink,
        mailbox: ClientMailbox::new(sender.downgrade()),
    });

    let shared = ClientShared::new(context, config.resolver, identifier);
    let actor = ClientActor::new(logger, receiver, ClientBehavior::new(shared.clone()));
    tokio::spawn(actor.run_event_loop());

    Ok(ShardClient {
        handle: ClientHandle::new(shared),
        sender,
    })
}
