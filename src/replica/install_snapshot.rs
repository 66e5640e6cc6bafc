use crate::replica::messages::FIRST_CHUNK_INDEX;
use crate::replica::peers::MemberId;
use bytes::{Bytes, BytesMut};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::time::{Duration, Instant};

pub(crate) fn chunk_hash(chunk: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    chunk.hash(&mut hasher);
    hasher.finish()
}

/// A chunk ready to go out in an InstallSnapshot message.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct SnapshotChunk {
    pub(crate) data: Bytes,
    pub(crate) chunk_index: i32,
    pub(crate) total_chunks: i32,
    pub(crate) last_chunk_hash: Option<u64>,
}

impl SnapshotChunk {
    pub(crate) fn is_last(&self) -> bool {
        self.chunk_index == self.total_chunks
    }
}

/// LeaderInstallSnapshotState tracks how far the leader got sending one snapshot to one follower.
/// Only one chunk is outstanding at a time.
#[derive(Debug)]
pub(crate) struct LeaderInstallSnapshotState {
    snapshot_bytes: Option<Bytes>,
    chunk_size: usize,
    total_chunks: i32,
    /// Index of the chunk sent last, 0 before the first one.
    chunk_index: i32,
    awaiting_reply: bool,
    last_acked_hash: Option<u64>,
    sent_hash: Option<u64>,
    sent_at: Option<Instant>,
}

impl LeaderInstallSnapshotState {
    pub(crate) fn new(chunk_size: usize) -> Self {
        LeaderInstallSnapshotState {
            snapshot_bytes: None,
            chunk_size: chunk_size.max(1),
            total_chunks: 0,
            chunk_index: FIRST_CHUNK_INDEX - 1,
            awaiting_reply: false,
            last_acked_hash: None,
            sent_hash: None,
            sent_at: None,
        }
    }

    /// No-op if the bytes were already set.
    pub(crate) fn set_snapshot_bytes(&mut self, bytes: Bytes) {
        if self.snapshot_bytes.is_some() {
            return;
        }
        let chunks = (bytes.len() + self.chunk_size - 1) / self.chunk_size;
        self.total_chunks = chunks.max(1) as i32;
        self.snapshot_bytes = Some(bytes);
    }

    pub(crate) fn chunk_index(&self) -> i32 {
        self.chunk_index
    }

    #[cfg(test)]
    pub(crate) fn total_chunks(&self) -> i32 {
        self.total_chunks
    }

    pub(crate) fn can_send_next_chunk(&self) -> bool {
        self.snapshot_bytes.is_some() && !self.awaiting_reply
    }

    pub(crate) fn is_last_chunk(&self, chunk_index: i32) -> bool {
        chunk_index == self.total_chunks
    }

    /// Returns the chunk to send: the next one after an ack, the same one again after a failure.
    pub(crate) fn next_chunk(&mut self, now: Instant) -> Option<SnapshotChunk> {
        if !self.can_send_next_chunk() {
            return None;
        }
        let bytes = self.snapshot_bytes.as_ref()?;

        if self.chunk_index < FIRST_CHUNK_INDEX {
            self.chunk_index = FIRST_CHUNK_INDEX;
        }
        let start = ((self.chunk_index - FIRST_CHUNK_INDEX) as usize) * self.chunk_size;
        let end = (start + self.chunk_size).min(bytes.len());
        let data = bytes.slice(start.min(end)..end);

        self.sent_hash = Some(chunk_hash(&data));
        self.awaiting_reply = true;
        self.sent_at = Some(now);

        Some(SnapshotChunk {
            data,
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            last_chunk_hash: self.last_acked_hash,
        })
    }

    /// Records the follower's answer for the outstanding chunk.
    pub(crate) fn mark_send_status(&mut self, success: bool) {
        self.awaiting_reply = false;
        if success {
            self.last_acked_hash = self.sent_hash;
            self.chunk_index += 1;
            self.sent_hash = None;
        }
    }

    pub(crate) fn is_chunk_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        match self.sent_at {
            Some(sent_at) => self.awaiting_reply && now.saturating_duration_since(sent_at) > timeout,
            None => false,
        }
    }

    /// Starts over from the first chunk. Used when the follower lost track of the transfer.
    pub(crate) fn reset(&mut self) {
        self.chunk_index = FIRST_CHUNK_INDEX - 1;
        self.awaiting_reply = false;
        self.last_acked_hash = None;
        self.sent_hash = None;
        self.sent_at = None;
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub(crate) enum InvalidChunk {
    #[error("All {0} chunks were already received")]
    AlreadySealed(i32),
    #[error("Expected chunk index {expected}, got {actual}")]
    OutOfOrder { expected: i32, actual: i32 },
    #[error("Hash of the previous chunk does not match the leader's")]
    HashMismatch,
}

/// SnapshotTracker reassembles a snapshot on the follower, validating chunk order and hashes.
#[derive(Debug)]
pub(crate) struct SnapshotTracker {
    leader_id: MemberId,
    total_chunks: i32,
    last_chunk_index: i32,
    last_chunk_hash: Option<u64>,
    buffer: BytesMut,
    sealed: bool,
}

impl SnapshotTracker {
    pub(crate) fn new(leader_id: MemberId, total_chunks: i32) -> Self {
        SnapshotTracker {
            leader_id,
            total_chunks,
            last_chunk_index: FIRST_CHUNK_INDEX - 1,
            last_chunk_hash: None,
            buffer: BytesMut::new(),
            sealed: false,
        }
    }

    pub(crate) fn leader_id(&self) -> &MemberId {
        &self.leader_id
    }

    /// Returns true once the last chunk was added.
    pub(crate) fn add_chunk(
        &mut self,
        chunk_index: i32,
        chunk: &[u8],
        last_chunk_hash: Option<u64>,
    ) -> Result<bool, InvalidChunk> {
        if self.sealed {
            return Err(InvalidChunk::AlreadySealed(self.total_chunks));
        }
        if self.last_chunk_index + 1 != chunk_index {
            return Err(InvalidChunk::OutOfOrder {
                expected: self.last_chunk_index + 1,
                actual: chunk_index,
            });
        }
        if last_chunk_hash.is_some() && last_chunk_hash != self.last_chunk_hash {
            return Err(InvalidChunk::HashMismatch);
        }

        self.buffer.extend_from_slice(chunk);
        self.last_chunk_index = chunk_index;
        self.last_chunk_hash = Some(chunk_hash(chunk));
        if chunk_index == self.total_chunks {
            self.sealed = true;
        }
        Ok(self.sealed)
    }

    pub(crate) fn into_snapshot_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}
