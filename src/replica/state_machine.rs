use bytes::Bytes;

/// RaftStateMachine is the application state that raft keeps in sync. Every method is invoked on
/// the replica task, so implementations must not block for long.
pub trait RaftStateMachine: Send {
    /// Applies one committed command. Called exactly once per index, in index order.
    fn apply_command(&mut self, index: i64, command: &Bytes);

    /// Applies commands replayed from the journal during recovery.
    fn apply_recovered_batch(&mut self, commands: Vec<(i64, Bytes)>) {
        for (index, command) in commands {
            self.apply_command(index, &command);
        }
    }

    /// Serializes the full state for a snapshot.
    fn take_snapshot(&mut self) -> Bytes;

    /// Replaces the full state with a snapshot's state.
    fn apply_snapshot(&mut self, state: &Bytes);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Appends every command to a shared list. Snapshots are the list joined with `,`.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingStateMachine {
        applied: Arc<Mutex<Vec<(i64, Bytes)>>>,
    }

    impl RecordingStateMachine {
        pub(crate) fn applied(&self) -> Vec<(i64, Bytes)> {
            self.applied.lock().unwrap().clone()
        }

        pub(crate) fn applied_indexes(&self) -> Vec<i64> {
            self.applied.lock().unwrap().iter().map(|(i, _)| *i).collect()
        }
    }

    impl RaftStateMachine for RecordingStateMachine {
        fn apply_command(&mut self, index: i64, command: &Bytes) {
            self.applied.lock().unwrap().push((index, command.clone()));
        }

        fn take_snapshot(&mut self) -> Bytes {
            let applied = self.applied.lock().unwrap();
            let joined = applied
                .iter()
                .map(|(i, c)| format!("{}={}", i, String::from_utf8_lossy(c)))
                .collect::<Vec<_>>()
                .join(",");
            Bytes::from(joined)
        }

        fn apply_snapshot(&mut self, state: &Bytes) {
            let mut applied = self.applied.lock().unwrap();
            applied.clear();
            for item in String::from_utf8_lossy(state).split(',').filter(|s| !s.is_empty()) {
                if let Some((index, command)) = item.split_once('=') {
                    if let Ok(index) = index.parse() {
                        applied.push((index, Bytes::from(command.to_string())));
                    }
                }
            }
        }
    }
}
