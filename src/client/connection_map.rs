use crate::client::types::ShardCookie;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

type Snapshot<V> = Arc<HashMap<ShardCookie, Arc<V>>>;

/// Read-copy-update map from shard to its current connection.
///
/// Readers never block each other. A writer copies the map, modifies the copy and publishes it.
/// `generation` is odd while a write is in progress; optimistic readers that see it change retry,
/// and readers that arrive during a write wait for it to finish.
pub(crate) struct ConnectionMap<V> {
    snapshot: RwLock<Snapshot<V>>,
    generation: AtomicU64,
    writer: Mutex<()>,
    completed: watch::Sender<u64>,
}

impl<V> ConnectionMap<V> {
    pub(crate) fn new() -> Self {
        let (completed, _) = watch::channel(0);
        ConnectionMap {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            generation: AtomicU64::new(0),
            writer: Mutex::new(()),
            completed,
        }
    }

    fn load(&self) -> Snapshot<V> {
        let snapshot = self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshot.clone()
    }

    /// Current value for `cookie`. Never waits for writers.
    pub(crate) fn get(&self, cookie: ShardCookie) -> Option<Arc<V>> {
        self.load().get(&cookie).cloned()
    }

    pub(crate) fn is_current(&self, cookie: ShardCookie, value: &Arc<V>) -> bool {
        matches!(self.get(cookie), Some(current) if Arc::ptr_eq(&current, value))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.load().len()
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the value for `cookie`, inserting `create()` if there is none. The flag is true when
    /// this call inserted it.
    pub(crate) async fn get_or_create(&self, cookie: ShardCookie, create: impl FnOnce() -> Arc<V>) -> (Arc<V>, bool) {
        loop {
            let stamp = self.optimistic_read().await;
            let found = self.load().get(&cookie).cloned();
            if !self.validate(stamp) {
                continue;
            }
            if let Some(value) = found {
                return (value, false);
            }
            break;
        }

        self.write(move |map| {
            if let Some(value) = map.get(&cookie) {
                return (value.clone(), false);
            }
            let value = create();
            map.insert(cookie, value.clone());
            (value, true)
        })
    }

    /// Replaces `old` with `new`, unless something else replaced `old` first.
    pub(crate) fn replace(&self, cookie: ShardCookie, old: &Arc<V>, new: Arc<V>) -> bool {
        self.write(|map| match map.get(&cookie) {
            Some(current) if Arc::ptr_eq(current, old) => {
                map.insert(cookie, new);
                true
            }
            _ => false,
        })
    }

    /// Removes `old`, unless something else replaced it first.
    pub(crate) fn remove(&self, cookie: ShardCookie, old: &Arc<V>) -> bool {
        self.write(|map| match map.get(&cookie) {
            Some(current) if Arc::ptr_eq(current, old) => {
                map.remove(&cookie);
                true
            }
            _ => false,
        })
    }

    /// Removes and returns everything.
    pub(crate) fn clear(&self) -> Vec<Arc<V>> {
        self.write(|map| map.drain().map(|(_, value)| value).collect())
    }

    fn write<R>(&self, mutate: impl FnOnce(&mut HashMap<ShardCookie, Arc<V>>) -> R) -> R {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut copy: HashMap<ShardCookie, Arc<V>> = (*self.load()).clone();
        let result = mutate(&mut copy);
        {
            let mut snapshot = self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *snapshot = Arc::new(copy);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.completed.send_replace(generation);
        result
    }

    /// Waits out a write in progress and returns the stamp to validate against.
    async fn optimistic_read(&self) -> u64 {
        loop {
            let stamp = self.generation.load(Ordering::SeqCst);
            if stamp % 2 == 0 {
                return stamp;
            }

            let mut completed = self.completed.subscribe();
            while *completed.borrow_and_update() <= stamp {
                if completed.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn validate(&self, stamp: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(n: u64) -> ShardCookie {
        ShardCookie::new(n)
    }

    #[tokio::test]
    async fn creates_once_per_cookie() {
        let map: ConnectionMap<String> = ConnectionMap::new();
        let (first, created) = map.get_or_create(cookie(1), || Arc::new("one".to_string())).await;
        assert!(created);
        let (second, created) = map.get_or_create(cookie(1), || Arc::new("other".to_string())).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(map.len(), 1);
        assert_eq!(map.generation(), 2);
    }

    #[tokio::test]
    async fn replace_and_remove_only_apply_to_the_expected_value() {
        let map: ConnectionMap<String> = ConnectionMap::new();
        let (old, _) = map.get_or_create(cookie(1), || Arc::new("old".to_string())).await;
        let stranger = Arc::new("old".to_string());

        assert!(!map.replace(cookie(1), &stranger, Arc::new("new".to_string())));
        let new = Arc::new("new".to_string());
        assert!(map.replace(cookie(1), &old, new.clone()));
        assert!(map.is_current(cookie(1), &new));

        assert!(!map.remove(cookie(1), &old));
        assert!(map.remove(cookie(1), &new));
        assert!(map.get(cookie(1)).is_none());
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot_across_writes() {
        let map: ConnectionMap<String> = ConnectionMap::new();
        map.get_or_create(cookie(1), || Arc::new("a".to_string())).await;
        let before = map.load();

        map.get_or_create(cookie(2), || Arc::new("b".to_string())).await;
        assert_eq!(before.len(), 1);
        assert_eq!(map.len(), 2);

        let cleared = map.clear();
        assert_eq!(cleared.len(), 2);
        assert_eq!(map.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_agrees_on_one_value() {
        let map: Arc<ConnectionMap<u64>> = Arc::new(ConnectionMap::new());
        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let map = map.clone();
            tasks.push(tokio::spawn(async move {
                map.get_or_create(cookie(7), || Arc::new(i)).await
            }));
        }

        let mut created = 0;
        let mut values = Vec::new();
        for task in tasks {
            let (value, was_created) = task.await.unwrap();
            if was_created {
                created += 1;
            }
            values.push(value);
        }
        assert_eq!(created, 1);
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
