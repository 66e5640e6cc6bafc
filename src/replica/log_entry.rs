use crate::replica::peers::ServerConfigurationPayload;
use crate::replica::term_info::Term;
use bytes::Bytes;

/// Fixed per-entry overhead counted when sizing AppendEntries batches.
const ENTRY_HEADER_SIZE: usize = 16;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// Opaque application command.
    Command(Bytes),
    /// Membership change. Takes effect as soon as it's appended, not when committed.
    ServerConfig(ServerConfigurationPayload),
    /// Appended by a new leader so entries from previous terms can commit.
    Noop,
}

impl Payload {
    pub(crate) fn size(&self) -> usize {
        match self {
            Payload::Command(data) => data.len(),
            Payload::ServerConfig(config) => config.serialized_size(),
            Payload::Noop => 0,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub index: i64,
    pub term: Term,
    pub payload: Payload,
    pub(crate) persistence_pending: bool,
}

impl LogEntry {
    pub fn new(index: i64, term: Term, payload: Payload) -> Self {
        LogEntry {
            index,
            term,
            payload,
            persistence_pending: false,
        }
    }

    pub(crate) fn pending(index: i64, term: Term, payload: Payload) -> Self {
        LogEntry {
            index,
            term,
            payload,
            persistence_pending: true,
        }
    }

    pub fn is_persistence_pending(&self) -> bool {
        self.persistence_pending
    }

    pub(crate) fn size(&self) -> usize {
        self.payload.size()
    }

    pub(crate) fn serialized_size(&self) -> usize {
        self.payload.size() + ENTRY_HEADER_SIZE
    }
}
