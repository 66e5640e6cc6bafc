use crate::client::types::{BackendInfo, Request, RequestEnvelope, RequestSink, ShardCookie};
use bytes::Bytes;
use std::sync::Mutex;

pub(crate) fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub(crate) fn backend(name: &str, session_id: u64, max_messages: usize) -> BackendInfo {
    BackendInfo {
        name: name.to_string(),
        session_id,
        max_messages,
    }
}

pub(crate) fn request(target: u64, sequence: u64) -> Request {
    Request {
        cookie: ShardCookie::new(0),
        target,
        sequence,
        payload: Bytes::from(format!("request-{}", sequence)),
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<(BackendInfo, RequestEnvelope)>>,
}

impl RecordingSink {
    pub(crate) fn sent(&self) -> Vec<(BackendInfo, RequestEnvelope)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_sequences(&self) -> Vec<u64> {
        self.sent().iter().map(|(_, e)| e.request.sequence).collect()
    }
}

impl RequestSink for RecordingSink {
    fn send(&self, backend: &BackendInfo, envelope: RequestEnvelope) {
        self.sent.lock().unwrap().push((backend.clone(), envelope));
    }
}
