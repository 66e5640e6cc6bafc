use std::io;
use std::time::Duration;

/// Why a request didn't get a successful response. Cloneable, since one cause usually fails many
/// requests at once.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum RequestError {
    #[error("Backend {backend} is not the leader")]
    NotLeader { backend: String },

    #[error("Backend expected envelope sequence {expected}, got {actual}")]
    OutOfSequence { expected: u64, actual: u64 },

    #[error("Backend information for {backend} is stale")]
    StaleBackend { backend: String },

    #[error("Client generation {generation} has been retired")]
    RetiredGeneration { generation: u64 },

    #[error("Timed out after {elapsed:?}. The backend for {backend} is not available.")]
    Timeout { elapsed: Duration, backend: String },

    #[error("No progress in {elapsed:?}")]
    NoProgress { elapsed: Duration },

    #[error("{message}")]
    Runtime {
        message: String,
        #[source]
        cause: Option<Box<RequestError>>,
        /// Failures reported while the connection was already being replaced.
        suppressed: Vec<RequestError>,
    },

    /// Failure reported by the backend's request handling itself.
    #[error("Backend failed the request: {0}")]
    Backend(String),

    #[error("Client has stopped")]
    Closed,
}

impl RequestError {
    /// Retriable failures are handled by reconnecting and replaying; callers never see them
    /// unless the connection gives up.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RequestError::NotLeader { .. } | RequestError::OutOfSequence { .. } | RequestError::StaleBackend { .. }
        )
    }

    pub(crate) fn runtime(message: impl Into<String>, cause: Option<RequestError>) -> Self {
        RequestError::Runtime {
            message: message.into(),
            cause: cause.map(Box::new),
            suppressed: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Retried by the client after a fixed interval.
    #[error("Timed out resolving backend")]
    Timeout,

    /// Propagated to every request waiting on the shard.
    #[error("Backend resolution failed")]
    Request(#[source] RequestError),

    #[error("Backend resolution failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StateFileError {
    #[error("I/O failure on client state file")]
    Io(#[from] io::Error),

    #[error("Client state file belongs to {found_member}/{found_type}, expected {member}/{client_type}")]
    IdentityMismatch {
        member: String,
        client_type: String,
        found_member: String,
        found_type: String,
    },

    #[error("Client state file is corrupted: {0}")]
    Corrupted(String),

    #[error("Client generation counter is exhausted")]
    GenerationExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Illegal options for configuring client: {0}")]
    IllegalOptions(String),

    #[error("Failed to derive client generation")]
    StateFile(#[from] StateFileError),
}
