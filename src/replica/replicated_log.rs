use crate::replica::log_entry::LogEntry;
use crate::replica::persistence::{DataPersistenceProvider, JournalRecord, PersistCallback, PersistenceError};
use crate::replica::snapshot::Snapshot;
use crate::replica::term_info::Term;
use std::collections::VecDeque;

pub(crate) enum PersistMode {
    /// Blocks until durable. The entry is no longer pending when this returns.
    Sync,
    /// The callback reports durability later through the mailbox.
    Async(PersistCallback),
}

/// ReplicatedLog holds the un-snapshotted suffix of the raft log. Logical index `i` lives at
/// physical offset `i - snapshot_index - 1`.
///
/// Trimming after a snapshot is a three step affair: `snapshot_pre_commit` moves the prefix to a
/// shadow buffer, then `snapshot_commit` drops it or `snapshot_rollback` puts it back. Snapshot
/// persistence is async and can fail after the in-memory trim already happened.
pub(crate) struct ReplicatedLog {
    journal: VecDeque<LogEntry>,
    snapshot_index: i64,
    snapshot_term: Term,
    data_size: usize,

    snapshotted_journal: Option<Vec<LogEntry>>,
    previous_snapshot_index: i64,
    previous_snapshot_term: Term,

    logger: slog::Logger,
}

impl ReplicatedLog {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        ReplicatedLog {
            journal: VecDeque::new(),
            snapshot_index: -1,
            snapshot_term: Term::NONE,
            data_size: 0,
            snapshotted_journal: None,
            previous_snapshot_index: -1,
            previous_snapshot_term: Term::NONE,
            logger,
        }
    }

    /// Replaces the whole log with the state carried by `snapshot`.
    pub(crate) fn reset_to_snapshot(&mut self, snapshot: &Snapshot) {
        self.journal = snapshot.unapplied_entries.iter().cloned().collect();
        self.snapshot_index = snapshot.last_applied_index;
        self.snapshot_term = snapshot.last_applied_term;
        self.snapshotted_journal = None;
        self.previous_snapshot_index = -1;
        self.previous_snapshot_term = Term::NONE;
        self.recompute_data_size();
    }

    fn adjusted_index(&self, index: i64) -> Option<usize> {
        let adjusted = index - self.snapshot_index - 1;
        if adjusted >= 0 && (adjusted as usize) < self.journal.len() {
            Some(adjusted as usize)
        } else {
            None
        }
    }

    pub(crate) fn get(&self, index: i64) -> Option<&LogEntry> {
        self.adjusted_index(index).and_then(|i| self.journal.get(i))
    }

    pub(crate) fn last(&self) -> Option<&LogEntry> {
        self.journal.back()
    }

    pub(crate) fn last_index(&self) -> i64 {
        self.journal.back().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    pub(crate) fn last_term(&self) -> Term {
        self.journal.back().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub(crate) fn is_present(&self, index: i64) -> bool {
        self.adjusted_index(index).is_some()
    }

    pub(crate) fn is_in_snapshot(&self, index: i64) -> bool {
        index >= 0 && index <= self.snapshot_index && self.snapshot_index != -1
    }

    pub(crate) fn size(&self) -> usize {
        self.journal.len()
    }

    pub(crate) fn data_size(&self) -> usize {
        self.data_size
    }

    pub(crate) fn snapshot_index(&self) -> i64 {
        self.snapshot_index
    }

    pub(crate) fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Term of the entry at `index`, looking at the snapshot boundary too. `None` if unknown.
    pub(crate) fn term_at(&self, index: i64) -> Option<Term> {
        if index == self.snapshot_index {
            Some(self.snapshot_term)
        } else {
            self.get(index).map(|e| e.term)
        }
    }

    pub(crate) fn append(&mut self, entry: LogEntry) -> bool {
        if entry.index <= self.last_index() {
            slog::warn!(
                self.logger,
                "Rejecting append of index {} at or below last index {}",
                entry.index,
                self.last_index()
            );
            return false;
        }
        self.data_size += entry.size();
        self.journal.push_back(entry);
        true
    }

    /// Appends the entry and journals it. A sync persist failure takes the entry back out.
    pub(crate) fn append_and_persist(
        &mut self,
        entry: LogEntry,
        persistence: &mut dyn DataPersistenceProvider,
        mode: PersistMode,
    ) -> Result<bool, PersistenceError> {
        let index = entry.index;
        if !self.append(entry.clone()) {
            return Ok(false);
        }

        match mode {
            PersistMode::Sync => match persistence.persist(JournalRecord::Entry(entry)) {
                Ok(_) => {
                    self.mark_persisted(index);
                    Ok(true)
                }
                Err(e) => {
                    self.remove_from(index);
                    Err(e)
                }
            },
            PersistMode::Async(callback) => {
                persistence.persist_async(JournalRecord::Entry(entry), callback);
                Ok(true)
            }
        }
    }

    pub(crate) fn mark_persisted(&mut self, index: i64) {
        if let Some(i) = self.adjusted_index(index) {
            self.journal[i].persistence_pending = false;
        }
    }

    /// Longest run starting at `index` whose serialized size fits `max_data_size`. Never empty if
    /// `index` is present, even when the first entry alone is too large.
    pub(crate) fn get_from(&self, index: i64, max_entries: usize, max_data_size: usize) -> Vec<LogEntry> {
        let start = match self.adjusted_index(index) {
            Some(start) => start,
            None => return Vec::new(),
        };
        let end = start.saturating_add(max_entries).min(self.journal.len());

        let mut entries = Vec::new();
        let mut total_size = 0;
        for entry in self.journal.range(start..end) {
            total_size += entry.serialized_size();
            if total_size <= max_data_size || entries.is_empty() {
                entries.push(entry.clone());
            } else {
                break;
            }
        }
        entries
    }

    /// Drops every entry at or after `index`. Returns the physical offset removed from, or -1 if
    /// the index was not present.
    pub(crate) fn remove_from(&mut self, index: i64) -> i64 {
        let adjusted = match self.adjusted_index(index) {
            Some(adjusted) => adjusted,
            None => return -1,
        };
        for removed in self.journal.drain(adjusted..) {
            self.data_size -= removed.size();
        }
        adjusted as i64
    }

    pub(crate) fn remove_from_and_persist(
        &mut self,
        index: i64,
        persistence: &mut dyn DataPersistenceProvider,
    ) -> Result<bool, PersistenceError> {
        if self.remove_from(index) < 0 {
            return Ok(false);
        }
        persistence.persist(JournalRecord::DeleteEntries { from_index: index })?;
        Ok(true)
    }

    pub(crate) fn snapshot_pre_commit(&mut self, captured_index: i64, captured_term: Term) {
        assert!(
            captured_index >= self.snapshot_index,
            "Snapshot index {} precedes current snapshot index {}",
            captured_index,
            self.snapshot_index
        );

        let trim_count = ((captured_index - self.snapshot_index) as usize).min(self.journal.len());
        self.snapshotted_journal = Some(self.journal.drain(..trim_count).collect());

        self.previous_snapshot_index = self.snapshot_index;
        self.snapshot_index = captured_index;
        self.previous_snapshot_term = self.snapshot_term;
        self.snapshot_term = captured_term;
    }

    pub(crate) fn snapshot_commit(&mut self, update_data_size: bool) {
        self.snapshotted_journal = None;
        self.previous_snapshot_index = -1;
        self.previous_snapshot_term = Term::NONE;
        if update_data_size {
            self.recompute_data_size();
        }
    }

    pub(crate) fn snapshot_rollback(&mut self) {
        let snapshotted = match self.snapshotted_journal.take() {
            Some(entries) => entries,
            None => {
                slog::warn!(self.logger, "Snapshot rollback without a pre-commit, ignoring");
                return;
            }
        };
        for entry in snapshotted.into_iter().rev() {
            self.journal.push_front(entry);
        }
        self.snapshot_index = self.previous_snapshot_index;
        self.previous_snapshot_index = -1;
        self.snapshot_term = self.previous_snapshot_term;
        self.previous_snapshot_term = Term::NONE;
    }

    /// Whether appending `index` should trigger a snapshot, by batch count or data size.
    pub(crate) fn should_capture_snapshot(&self, index: i64, batch_count: u64, data_threshold: usize) -> bool {
        if batch_count > 0 && (index + 1) as u64 % batch_count == 0 {
            return true;
        }
        self.data_size > data_threshold
    }

    fn recompute_data_size(&mut self) {
        self.data_size = self.journal.iter().map(LogEntry::size).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::log_entry::Payload;
    use crate::replica::persistence::InMemoryJournal;
    use bytes::Bytes;

    fn log() -> ReplicatedLog {
        ReplicatedLog::new(slog::Logger::root(slog::Discard, slog::o!()))
    }

    fn entry(index: i64, term: i64, size: usize) -> LogEntry {
        LogEntry::new(index, Term::new(term), Payload::Command(Bytes::from(vec![b'x'; size])))
    }

    fn filled(last_index: i64) -> ReplicatedLog {
        let mut log = log();
        for i in 0..=last_index {
            assert!(log.append(entry(i, 1, 10)));
        }
        log
    }

    #[test]
    fn append_and_get() {
        let mut log = log();
        assert_eq!(log.last_index(), -1);
        assert_eq!(log.last_term(), Term::NONE);

        for i in 0..5 {
            assert!(log.append(entry(i, 1 + i / 2, 4)));
        }

        for i in 0..5 {
            assert_eq!(log.get(i), Some(&entry(i, 1 + i / 2, 4)));
        }
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.last_term(), Term::new(3));
        assert_eq!(log.data_size(), 20);
        assert!(log.get(5).is_none());
    }

    #[test]
    fn non_increasing_append_fails_without_change() {
        let mut log = filled(3);

        assert!(!log.append(entry(3, 9, 1)));
        assert!(!log.append(entry(1, 9, 1)));

        assert_eq!(log.size(), 4);
        assert_eq!(log.get(3), Some(&entry(3, 1, 10)));
        assert_eq!(log.data_size(), 40);
    }

    #[test]
    fn get_from_respects_data_size_but_returns_at_least_one() {
        let log = filled(4);

        // Serialized size is 10 + 16 per entry.
        assert_eq!(log.get_from(1, 10, 26 * 2).len(), 2);
        assert_eq!(log.get_from(1, 10, 1).len(), 1);
        assert_eq!(log.get_from(1, 2, usize::MAX).len(), 2);
        assert_eq!(log.get_from(3, 10, usize::MAX).len(), 2);
        assert!(log.get_from(5, 10, usize::MAX).is_empty());
    }

    #[test]
    fn remove_from_truncates_suffix() {
        let mut log = filled(4);

        assert_eq!(log.remove_from(2), 2);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.data_size(), 20);
        assert_eq!(log.remove_from(7), -1);
    }

    #[test]
    fn pre_commit_then_rollback_restores_everything() {
        let mut log = filled(5);
        let before: Vec<_> = (0..=5).map(|i| log.get(i).cloned()).collect();

        log.snapshot_pre_commit(2, Term::new(1));
        assert_eq!(log.snapshot_index(), 2);
        assert!(!log.is_present(2));
        assert!(log.is_in_snapshot(2));
        assert_eq!(log.size(), 3);

        log.snapshot_rollback();

        let after: Vec<_> = (0..=5).map(|i| log.get(i).cloned()).collect();
        assert_eq!(before, after);
        assert_eq!(log.snapshot_index(), -1);
        assert_eq!(log.snapshot_term(), Term::NONE);
        assert!(!log.is_in_snapshot(0));
    }

    #[test]
    fn pre_commit_then_commit_discards_prefix() {
        let mut log = filled(5);

        log.snapshot_pre_commit(3, Term::new(1));
        log.snapshot_commit(true);
        log.snapshot_rollback();

        assert_eq!(log.snapshot_index(), 3);
        assert!(log.get(3).is_none());
        assert_eq!(log.get(4), Some(&entry(4, 1, 10)));
        assert_eq!(log.data_size(), 20);
        assert_eq!(log.term_at(3), Some(Term::new(1)));
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn pre_commit_past_the_end_empties_journal() {
        let mut log = filled(1);

        log.snapshot_pre_commit(4, Term::new(2));
        log.snapshot_commit(true);

        assert_eq!(log.size(), 0);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.last_term(), Term::new(2));
    }

    #[test]
    #[should_panic]
    fn pre_commit_behind_snapshot_is_a_bug() {
        let mut log = filled(5);
        log.snapshot_pre_commit(3, Term::new(1));
        log.snapshot_commit(true);
        log.snapshot_pre_commit(2, Term::new(1));
    }

    #[test]
    fn sync_persist_failure_removes_entry() {
        let journal = InMemoryJournal::new();
        let mut persistence = journal.clone();
        let mut log = filled(0);

        let pending = LogEntry::pending(1, Term::new(1), Payload::Noop);
        assert!(log.append_and_persist(pending.clone(), &mut persistence, PersistMode::Sync).unwrap());
        assert!(!log.get(1).unwrap().is_persistence_pending());

        journal.fail_writes(true);
        let pending = LogEntry::pending(2, Term::new(1), Payload::Noop);
        assert!(log.append_and_persist(pending, &mut persistence, PersistMode::Sync).is_err());
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn snapshot_trigger_by_batch_or_size() {
        let log = filled(2);

        assert!(log.should_capture_snapshot(9, 10, usize::MAX));
        assert!(!log.should_capture_snapshot(8, 10, usize::MAX));
        assert!(log.should_capture_snapshot(8, 10, 29));
    }
}
