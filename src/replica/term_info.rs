use crate::properties;
use crate::replica::peers::MemberId;
use crate::replica::persistence::PersistenceError;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(i64);

impl Term {
    /// Term of a log position that does not exist.
    pub const NONE: Term = Term(-1);

    pub fn new(term: i64) -> Self {
        Term(term)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub(crate) fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TermInfo is the durable election state: the latest term we've seen and who we voted for in it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TermInfo {
    pub term: Term,
    pub voted_for: Option<MemberId>,
}

impl TermInfo {
    pub fn new(term: Term, voted_for: Option<MemberId>) -> Self {
        TermInfo { term, voted_for }
    }

    pub(crate) fn initial() -> Self {
        TermInfo {
            term: Term::new(0),
            voted_for: None,
        }
    }
}

/// TermInfoStore is used whenever raft requires the term or vote to be durable before acting on
/// it. A failed store must leave the in-memory value untouched so callers never act on an
/// unpersisted vote.
pub trait TermInfoStore: Send {
    fn current(&self) -> &TermInfo;

    /// Updates the in-memory value only. Used while recovering state that is already durable.
    fn set_term(&mut self, term_info: TermInfo);

    fn store_and_set_term(&mut self, term_info: TermInfo) -> Result<(), PersistenceError>;

    /// Loads the durable value, if any, and makes it current.
    fn load_and_set_term(&mut self) -> Result<Option<TermInfo>, PersistenceError>;
}

/// Keeps term info in memory only. Suitable for tests and members that rejoin with empty state.
pub struct VolatileTermInfoStore {
    current: TermInfo,
}

impl VolatileTermInfoStore {
    pub fn new() -> Self {
        VolatileTermInfoStore {
            current: TermInfo::initial(),
        }
    }
}

impl Default for VolatileTermInfoStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TermInfoStore for VolatileTermInfoStore {
    fn current(&self) -> &TermInfo {
        &self.current
    }

    fn set_term(&mut self, term_info: TermInfo) {
        self.current = term_info;
    }

    fn store_and_set_term(&mut self, term_info: TermInfo) -> Result<(), PersistenceError> {
        self.current = term_info;
        Ok(())
    }

    fn load_and_set_term(&mut self) -> Result<Option<TermInfo>, PersistenceError> {
        Ok(None)
    }
}

const TERM_KEY: &str = "term";
const VOTED_FOR_KEY: &str = "voted-for";

/// Stores term info in a small properties file, replaced atomically on every store.
pub struct FileTermInfoStore {
    path: PathBuf,
    current: TermInfo,
}

impl FileTermInfoStore {
    pub fn new(directory: &Path, member_id: &MemberId) -> Self {
        FileTermInfoStore {
            path: directory.join(format!("{}-term-info.properties", member_id)),
            current: TermInfo::initial(),
        }
    }
}

impl TermInfoStore for FileTermInfoStore {
    fn current(&self) -> &TermInfo {
        &self.current
    }

    fn set_term(&mut self, term_info: TermInfo) {
        self.current = term_info;
    }

    fn store_and_set_term(&mut self, term_info: TermInfo) -> Result<(), PersistenceError> {
        let voted_for = term_info
            .voted_for
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        properties::write_properties_atomically(
            &self.path,
            &[(TERM_KEY, term_info.term.as_i64().to_string()), (VOTED_FOR_KEY, voted_for)],
        )?;
        self.current = term_info;
        Ok(())
    }

    fn load_and_set_term(&mut self) -> Result<Option<TermInfo>, PersistenceError> {
        let properties = match properties::read_properties(&self.path)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let term = properties
            .get(TERM_KEY)
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(|| PersistenceError::Corrupted(format!("missing or invalid {}", TERM_KEY)))?;
        let voted_for = properties
            .get(VOTED_FOR_KEY)
            .filter(|v| !v.is_empty())
            .map(|v| MemberId::new(v.as_str()));

        let term_info = TermInfo::new(Term::new(term), voted_for);
        self.current = term_info.clone();
        Ok(Some(term_info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_survives_reload() {
        let dir = properties::unique_temp_dir("term-info");
        let me = MemberId::new("member-1");

        let mut store = FileTermInfoStore::new(&dir, &me);
        assert_eq!(store.load_and_set_term().unwrap(), None);
        assert_eq!(store.current(), &TermInfo::initial());

        store
            .store_and_set_term(TermInfo::new(Term::new(7), Some(MemberId::new("member-3"))))
            .unwrap();
        store
            .store_and_set_term(TermInfo::new(Term::new(8), None))
            .unwrap();

        let mut reopened = FileTermInfoStore::new(&dir, &me);
        let loaded = reopened.load_and_set_term().unwrap();
        assert_eq!(loaded, Some(TermInfo::new(Term::new(8), None)));
        assert_eq!(reopened.current().term, Term::new(8));
    }

    #[test]
    fn failed_store_leaves_current_untouched() {
        let dir = properties::unique_temp_dir("term-info");
        let mut store = FileTermInfoStore::new(&dir.join("does-not-exist"), &MemberId::new("m"));

        let result = store.store_and_set_term(TermInfo::new(Term::new(3), None));

        assert!(result.is_err());
        assert_eq!(store.current(), &TermInfo::initial());
    }

    #[test]
    fn set_term_does_not_persist() {
        let dir = properties::unique_temp_dir("term-info");
        let me = MemberId::new("m");
        let mut store = FileTermInfoStore::new(&dir, &me);

        store.set_term(TermInfo::new(Term::new(4), None));

        assert_eq!(store.current().term, Term::new(4));
        assert_eq!(FileTermInfoStore::new(&dir, &me).load_and_set_term().unwrap(), None);
    }
}
