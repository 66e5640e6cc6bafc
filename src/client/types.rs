use crate::client::errors::{RequestError, ResolveError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// ShardCookie names the shard a request is routed to. Every shard has its own connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ShardCookie(u64);

impl ShardCookie {
    pub fn new(cookie: u64) -> Self {
        ShardCookie(cookie)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShardCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Who this client is. The generation goes up every time the client restarts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientIdentifier {
    pub member_name: String,
    pub client_type: String,
    pub generation: u64,
}

/// Where a shard's leader lives, as resolved by a `BackendInfoResolver`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackendInfo {
    pub name: String,
    /// Changes whenever the client talks to a new incarnation of the backend. Responses from an
    /// older session are dropped.
    pub session_id: u64,
    /// How many requests may be in flight to this backend at once.
    pub max_messages: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub cookie: ShardCookie,
    /// What the request operates on, e.g. a transaction. Together with `sequence` it identifies
    /// the request.
    pub target: u64,
    pub sequence: u64,
    pub payload: Bytes,
}

/// A request as transmitted to one backend session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestEnvelope {
    pub request: Request,
    pub session_id: u64,
    pub tx_sequence: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEnvelope {
    pub cookie: ShardCookie,
    pub target: u64,
    pub sequence: u64,
    pub session_id: u64,
    pub tx_sequence: u64,
    pub execution_nanos: u64,
    pub result: Result<Bytes, RequestError>,
}

impl ResponseEnvelope {
    pub fn success(request: &RequestEnvelope, payload: Bytes) -> Self {
        Self::new(request, Ok(payload))
    }

    pub fn failure(request: &RequestEnvelope, cause: RequestError) -> Self {
        Self::new(request, Err(cause))
    }

    fn new(request: &RequestEnvelope, result: Result<Bytes, RequestError>) -> Self {
        ResponseEnvelope {
            cookie: request.request.cookie,
            target: request.request.target,
            sequence: request.request.sequence,
            session_id: request.session_id,
            tx_sequence: request.tx_sequence,
            execution_nanos: 0,
            result,
        }
    }
}

/// RequestSink transmits requests to backends. Sending must not block: the client calls it while
/// holding a connection's lock.
pub trait RequestSink: Send + Sync {
    fn send(&self, backend: &BackendInfo, envelope: RequestEnvelope);
}

pub type StaleCallback = Arc<dyn Fn(ShardCookie) + Send + Sync>;

/// Returned by `notify_when_backend_info_is_stale`. Resolvers stop calling back once it's closed.
#[derive(Clone, Debug, Default)]
pub struct StaleRegistration {
    token: CancellationToken,
}

impl StaleRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// BackendInfoResolver maps a shard to its current leader.
#[async_trait::async_trait]
pub trait BackendInfoResolver: Send + Sync {
    async fn get_backend_info(&self, cookie: ShardCookie) -> Result<BackendInfo, ResolveError>;

    /// Resolves again, knowing `stale` no longer works.
    async fn refresh_backend_info(&self, cookie: ShardCookie, stale: &BackendInfo) -> Result<BackendInfo, ResolveError>;

    /// `callback` is invoked with a cookie whenever the resolver learns that shard moved.
    fn notify_when_backend_info_is_stale(&self, callback: StaleCallback) -> StaleRegistration;

    fn resolve_cookie_name(&self, cookie: ShardCookie) -> String {
        cookie.to_string()
    }
}
