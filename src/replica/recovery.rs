use crate::replica::context::RaftContext;
use crate::replica::log_entry::Payload;
use crate::replica::persistence::{JournalRecord, PersistenceError};
use bytes::Bytes;
use std::time::Instant;

/// Rebuilds a member's state from its term store, latest snapshot and journal. Runs once before
/// the member starts; any failure aborts startup.
pub(crate) fn recover(ctx: &mut RaftContext) -> Result<(), PersistenceError> {
    let started = Instant::now();
    let stored_term = ctx.term_store.load_and_set_term()?;
    let recovered = ctx.persistence.recover()?;

    if let Some(snapshot) = &recovered.snapshot {
        ctx.log.reset_to_snapshot(snapshot);
        ctx.last_applied = snapshot.last_applied_index;
        ctx.commit_index = snapshot.last_applied_index;
        if stored_term.is_none() || snapshot.term_info.term > ctx.current_term() {
            ctx.term_store.set_term(snapshot.term_info.clone());
        }
        if let Some(config) = &snapshot.server_config {
            ctx.peers.update_from_config(config);
        }
        ctx.state_machine.apply_snapshot(&snapshot.state);
        slog::info!(
            ctx.logger,
            "Recovered snapshot: last applied {} term {:?}, {} unapplied entries",
            snapshot.last_applied_index,
            snapshot.last_applied_term,
            snapshot.unapplied_entries.len()
        );
    }

    let mut replay = Replay::default();
    for record in recovered.records {
        match record {
            JournalRecord::Entry(mut entry) => {
                if entry.index <= ctx.log.last_index() {
                    continue;
                }
                entry.persistence_pending = false;
                if let Payload::ServerConfig(config) = &entry.payload {
                    ctx.peers.update_from_config(config);
                }
                ctx.log.append(entry);
                replay.entries += 1;
            }
            JournalRecord::ApplyJournalEntries { to_index } => {
                apply_recovered(ctx, to_index);
                replay.applied_records += 1;
            }
            JournalRecord::DeleteEntries { from_index } => {
                ctx.log.remove_from(from_index);
                replay.deletes += 1;
            }
        }
    }

    slog::info!(
        ctx.logger,
        "Recovery completed in {:?}: term {:?}, last index {}, last applied {}, snapshot index {}, \
         {} entries, {} apply records, {} deletes replayed",
        started.elapsed(),
        ctx.current_term(),
        ctx.log.last_index(),
        ctx.last_applied,
        ctx.log.snapshot_index(),
        replay.entries,
        replay.applied_records,
        replay.deletes
    );
    Ok(())
}

#[derive(Default)]
struct Replay {
    entries: usize,
    applied_records: usize,
    deletes: usize,
}

/// Applies entries up to `to_index` in batches. Only commands reach the state machine.
fn apply_recovered(ctx: &mut RaftContext, to_index: i64) {
    let batch_size = ctx.options.journal_recovery_batch_size.max(1);
    let mut batch: Vec<(i64, Bytes)> = Vec::with_capacity(batch_size);

    let mut index = ctx.last_applied + 1;
    while index <= to_index {
        let entry = match ctx.log.get(index) {
            Some(entry) => entry,
            None => {
                slog::warn!(ctx.logger, "Journal says {} was applied but the entry is missing", index);
                break;
            }
        };
        if let Payload::Command(command) = &entry.payload {
            batch.push((index, command.clone()));
            if batch.len() >= batch_size {
                ctx.state_machine.apply_recovered_batch(std::mem::take(&mut batch));
            }
        }
        ctx.last_applied = index;
        index += 1;
    }
    if !batch.is_empty() {
        ctx.state_machine.apply_recovered_batch(batch);
    }
    ctx.commit_index = ctx.commit_index.max(ctx.last_applied);
}

#[cfg(test)]
mod tests {
    use crate::replica::test_harness::TestCluster;
    use crate::replica::{MemberId, Term, VotingState};

    #[tokio::test]
    async fn recovery_starts_from_the_snapshot_and_replays_the_rest() {
        let mut cluster = TestCluster::with_options(&["a", "b", "c"], |options| options.journal_recovery_batch_size = 2);
        cluster.start();
        cluster.elect("a").await;
        for i in 0..3 {
            cluster.submit("a", format!("cmd-{}", i)).await.unwrap();
        }
        cluster.heartbeat("a");
        cluster.settle().await;
        cluster.replica_mut("b").capture_snapshot().unwrap();
        cluster.settle().await;
        for i in 3..6 {
            cluster.submit("a", format!("cmd-{}", i)).await.unwrap();
        }
        cluster.heartbeat("a");
        cluster.settle().await;

        let restarted = cluster.restart("b");
        assert_eq!(restarted.applied_indexes(), vec![0, 1, 2, 3, 4, 5]);
        let b = cluster.state("b");
        assert_eq!(b.snapshot_index, 2);
        assert_eq!(b.last_index, 5);
        assert_eq!(b.last_applied, 5);
        assert_eq!(b.commit_index, 5);
        assert_eq!(b.term, Term::new(1));
        assert_eq!(b.voted_for, Some(MemberId::new("a")));
    }

    #[tokio::test]
    async fn recovery_replays_deletes_and_configuration() {
        let mut cluster = TestCluster::new(&["a", "b", "c"]);
        cluster.start();
        cluster.elect("a").await;
        cluster.submit("a", "kept").await.unwrap();

        cluster.transport.isolate(&MemberId::new("a"));
        cluster.submit_no_wait("a", "dropped");
        cluster.settle().await;
        cluster.trigger_election("b");
        cluster.settle().await;
        cluster.transport.heal(&MemberId::new("a"));
        cluster.heartbeat("b");
        cluster.settle().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        cluster.replica_mut("b").handle_server_change(
            crate::replica::ServerChangeRequest::ChangeServersVotingStatus {
                voting: vec![(MemberId::new("c"), false)].into_iter().collect(),
                servers_visited: Vec::new(),
            },
            tx,
        );
        cluster.settle().await;
        rx.await.unwrap();
        cluster.heartbeat("b");
        cluster.settle().await;

        let before = cluster.state("a");
        cluster.restart("a");
        let after = cluster.state("a");
        assert_eq!(after.last_index, before.last_index);
        assert_eq!(after.last_term, before.last_term);
        let c = after.peers.iter().find(|p| p.id == MemberId::new("c")).unwrap();
        assert_eq!(c.voting_state, VotingState::NonVoting);
    }
}
