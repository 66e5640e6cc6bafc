//! Client side of request routing to shard leaders: per-shard request queues that survive
//! leader moves, backpressure, and timeouts.
mod actor;
mod behavior;
mod connection;
mod connection_map;
mod errors;
mod options;
mod progress_tracker;
mod state_file;
#[cfg(test)]
mod testing;
mod transmit_queue;
mod types;
mod wiring;

pub use errors::ClientError;
pub use errors::RequestError;
pub use errors::ResolveError;
pub use errors::StateFileError;
pub use options::ClientOptions;
pub use types::BackendInfo;
pub use types::BackendInfoResolver;
pub use types::ClientIdentifier;
pub use types::Request;
pub use types::RequestEnvelope;
pub use types::RequestSink;
pub use types::ResponseEnvelope;
pub use types::ShardCookie;
pub use types::StaleCallback;
pub use types::StaleRegistration;
pub use wiring::try_create_shard_client;
pub use wiring::PendingResponse;
pub use wiring::ShardClient;
pub use wiring::ShardClientConfig;
