use crate::actor::{Event, WeakActorClient};
use crate::replica::log_entry::LogEntry;
use crate::replica::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use std::io;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O failure")]
    Io(#[from] io::Error),
    #[error("Persistent state is corrupted: {0}")]
    Corrupted(String),
    #[error("Store rejected the write: {0}")]
    Rejected(String),
}

/// Everything the journal holds besides snapshots. Replayed in order on recovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JournalRecord {
    Entry(LogEntry),
    /// All entries up to and including `to_index` were applied to the state machine.
    ApplyJournalEntries { to_index: i64 },
    /// Entries from `from_index` onwards were discarded to repair a divergent log.
    DeleteEntries { from_index: i64 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotMetadata {
    pub sequence_nr: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RecoveredState {
    pub snapshot: Option<Snapshot>,
    pub records: Vec<JournalRecord>,
}

/// What the replica does once an asynchronously persisted record is durable.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum PersistContinuation {
    /// A log entry. A leader counts its own copy toward commit only after this.
    Entry { index: i64 },
    /// Bookkeeping record with nothing to resume.
    Bookkeeping,
}

/// PersistCallback delivers the outcome of `persist_async` back into the owning replica's mailbox,
/// so the continuation runs on the replica task like every other state mutation.
#[derive(Debug)]
pub struct PersistCallback {
    actor_client: WeakActorClient,
    continuation: PersistContinuation,
}

impl PersistCallback {
    pub(crate) fn new(actor_client: WeakActorClient, continuation: PersistContinuation) -> Self {
        PersistCallback {
            actor_client,
            continuation,
        }
    }

    pub fn complete(self, result: Result<(), PersistenceError>) {
        self.actor_client.deliver(Event::PersistCompleted(self.continuation, result));
    }
}

#[derive(Debug)]
pub struct SnapshotCallback {
    actor_client: WeakActorClient,
}

impl SnapshotCallback {
    pub(crate) fn new(actor_client: WeakActorClient) -> Self {
        SnapshotCallback { actor_client }
    }

    pub fn complete(self, result: Result<SnapshotMetadata, PersistenceError>) {
        self.actor_client.deliver(Event::SnapshotSaved(result));
    }
}

/// DataPersistenceProvider is the journal and snapshot store of one member.
///
/// `persist` returns only once the record is durable and blocks the replica meanwhile.
/// `persist_async`, `save_snapshot` report later through their callbacks. Deletes are fire and
/// forget.
pub trait DataPersistenceProvider: Send {
    /// Returns the sequence number assigned to the record.
    fn persist(&mut self, record: JournalRecord) -> Result<u64, PersistenceError>;

    fn persist_async(&mut self, record: JournalRecord, callback: PersistCallback);

    fn save_snapshot(&mut self, snapshot: Snapshot, callback: SnapshotCallback);

    /// Deletes snapshots saved at or before `max_sequence_nr`, always keeping the latest one.
    fn delete_snapshots(&mut self, max_sequence_nr: u64);

    /// Deletes journal records with sequence numbers up to and including `up_to_sequence_nr`.
    fn delete_messages(&mut self, up_to_sequence_nr: u64);

    fn last_sequence_number(&self) -> u64;

    /// Latest snapshot plus every retained journal record, in order.
    fn recover(&mut self) -> Result<RecoveredState, PersistenceError>;
}

/// InMemoryJournal keeps records and snapshots in memory. Clones share the same store, so a test
/// can drop a member and recover a new one from the same journal.
#[derive(Clone, Default)]
pub struct InMemoryJournal {
    inner: Arc<Mutex<JournalInner>>,
}

#[derive(Default)]
struct JournalInner {
    records: Vec<(u64, JournalRecord)>,
    last_sequence_nr: u64,
    snapshots: Vec<(SnapshotMetadata, Snapshot)>,
    fail_writes: bool,
    fail_snapshots: bool,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent journal write fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Makes every subsequent snapshot save fail until reset.
    pub fn fail_snapshot_saves(&self, fail: bool) {
        self.lock().fail_snapshots = fail;
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.lock().records.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.lock().snapshots.last().map(|(_, s)| s.clone())
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalInner> {
        // A panic while holding this lock is a test failure already, keep the data usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, record: JournalRecord) -> Result<u64, PersistenceError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(PersistenceError::Rejected("journal writes disabled".to_string()));
        }
        inner.last_sequence_nr += 1;
        let sequence_nr = inner.last_sequence_nr;
        inner.records.push((sequence_nr, record));
        Ok(sequence_nr)
    }
}

impl DataPersistenceProvider for InMemoryJournal {
    fn persist(&mut self, record: JournalRecord) -> Result<u64, PersistenceError> {
        self.append(record)
    }

    fn persist_async(&mut self, record: JournalRecord, callback: PersistCallback) {
        callback.complete(self.append(record).map(|_| ()));
    }

    fn save_snapshot(&mut self, snapshot: Snapshot, callback: SnapshotCallback) {
        let result = {
            let mut inner = self.lock();
            if inner.fail_snapshots {
                Err(PersistenceError::Rejected("snapshot saves disabled".to_string()))
            } else {
                let metadata = SnapshotMetadata {
                    sequence_nr: inner.last_sequence_nr,
                    timestamp: Utc::now(),
                };
                inner.snapshots.push((metadata.clone(), snapshot));
                Ok(metadata)
            }
        };
        callback.complete(result);
    }

    fn delete_snapshots(&mut self, max_sequence_nr: u64) {
        let mut inner = self.lock();
        let len = inner.snapshots.len();
        let mut position = 0;
        inner.snapshots.retain(|(metadata, _)| {
            position += 1;
            position == len || metadata.sequence_nr > max_sequence_nr
        });
    }

    fn delete_messages(&mut self, up_to_sequence_nr: u64) {
        self.lock()
            .records
            .retain(|(sequence_nr, _)| *sequence_nr > up_to_sequence_nr);
    }

    fn last_sequence_number(&self) -> u64 {
        self.lock().last_sequence_nr
    }

    fn recover(&mut self) -> Result<RecoveredState, PersistenceError> {
        let inner = self.lock();
        Ok(RecoveredState {
            snapshot: inner.snapshots.last().map(|(_, s)| s.clone()),
            records: inner.records.iter().map(|(_, r)| r.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::log_entry::Payload;
    use crate::replica::term_info::Term;

    fn entry(index: i64) -> JournalRecord {
        JournalRecord::Entry(LogEntry::new(index, Term::new(1), Payload::Noop))
    }

    #[test]
    fn sequence_numbers_increase_and_deletes_are_bounded() {
        let mut journal = InMemoryJournal::new();
        assert_eq!(journal.persist(entry(0)).unwrap(), 1);
        assert_eq!(journal.persist(entry(1)).unwrap(), 2);
        assert_eq!(journal.persist(JournalRecord::ApplyJournalEntries { to_index: 1 }).unwrap(), 3);

        journal.delete_messages(2);

        assert_eq!(journal.last_sequence_number(), 3);
        assert_eq!(journal.records(), vec![JournalRecord::ApplyJournalEntries { to_index: 1 }]);
    }

    #[test]
    fn clones_share_the_store_and_writes_can_fail() {
        let journal = InMemoryJournal::new();
        let mut writer = journal.clone();

        writer.persist(entry(0)).unwrap();
        journal.fail_writes(true);
        assert!(writer.persist(entry(1)).is_err());

        let recovered = journal.clone().recover().unwrap();
        assert_eq!(recovered.records, vec![entry(0)]);
        assert!(recovered.snapshot.is_none());
    }
}
