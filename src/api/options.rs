use crate::replica::ReplicaOptions;
use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs of one raft member. Unset fields take the defaults listed on each field.
#[derive(Clone, Default)]
pub struct RaftOptions {
    /// Default 100ms.
    pub leader_heartbeat_duration: Option<Duration>,
    /// Default 500ms.
    pub follower_min_timeout: Option<Duration>,
    /// Default 1500ms.
    pub follower_max_timeout: Option<Duration>,
    /// Capture a snapshot every this many entries. Default 20 000.
    pub snapshot_batch_count: Option<u64>,
    /// Capture a snapshot once the in-memory log holds this many bytes. Default 64 MiB.
    pub snapshot_data_threshold: Option<usize>,
    /// Default 2 MiB.
    pub snapshot_chunk_size: Option<usize>,
    /// Default 1 000.
    pub max_append_entries: Option<usize>,
    /// Default is the snapshot chunk size.
    pub max_append_entries_data_size: Option<usize>,
    /// Default 10 × heartbeat.
    pub isolated_check_interval: Option<Duration>,
    /// Default 1 000.
    pub journal_recovery_batch_size: Option<usize>,
    /// Default true. Members with elections disabled only change role through `switch_behavior`.
    pub elections_enabled: Option<bool>,
}

pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub snapshot_batch_count: u64,
    pub snapshot_data_threshold: usize,
    pub snapshot_chunk_size: usize,
    pub max_append_entries: usize,
    pub max_append_entries_data_size: usize,
    pub isolated_check_interval: Duration,
    pub journal_recovery_batch_size: usize,
    pub elections_enabled: bool,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.snapshot_batch_count == 0 {
            return Err("Snapshot batch count must be positive");
        }
        if self.snapshot_chunk_size == 0 {
            return Err("Snapshot chunk size must be positive");
        }
        if self.max_append_entries == 0 || self.max_append_entries_data_size == 0 {
            return Err("AppendEntries limits must be positive");
        }
        if self.journal_recovery_batch_size == 0 {
            return Err("Journal recovery batch size must be positive");
        }

        Ok(())
    }

    pub(super) fn into_replica_options(self) -> ReplicaOptions {
        ReplicaOptions {
            leader_heartbeat_duration: self.leader_heartbeat_duration,
            follower_min_timeout: self.follower_min_timeout,
            follower_max_timeout: self.follower_max_timeout,
            snapshot_batch_count: self.snapshot_batch_count,
            snapshot_data_threshold: self.snapshot_data_threshold,
            snapshot_chunk_size: self.snapshot_chunk_size,
            max_append_entries: self.max_append_entries,
            max_append_entries_data_size: self.max_append_entries_data_size,
            isolated_check_interval: self.isolated_check_interval,
            journal_recovery_batch_size: self.journal_recovery_batch_size,
            elections_enabled: self.elections_enabled,
            spawn_timers: true,
        }
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let leader_heartbeat_duration = options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100));
        let snapshot_chunk_size = options.snapshot_chunk_size.unwrap_or(2 * 1024 * 1024);
        let values = RaftOptionsValidated {
            leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            snapshot_batch_count: options.snapshot_batch_count.unwrap_or(20_000),
            snapshot_data_threshold: options.snapshot_data_threshold.unwrap_or(64 * 1024 * 1024),
            snapshot_chunk_size,
            max_append_entries: options.max_append_entries.unwrap_or(1000),
            max_append_entries_data_size: options.max_append_entries_data_size.unwrap_or(snapshot_chunk_size),
            isolated_check_interval: options
                .isolated_check_interval
                .unwrap_or(leader_heartbeat_duration * 10),
            journal_recovery_batch_size: options.journal_recovery_batch_size.unwrap_or(1000),
            elections_enabled: options.elections_enabled.unwrap_or(true),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(options.isolated_check_interval, Duration::from_secs(1));
        assert_eq!(options.max_append_entries_data_size, options.snapshot_chunk_size);
        assert!(options.into_replica_options().spawn_timers);
    }

    #[test]
    fn heartbeat_must_be_shorter_than_election_timeout() {
        let result = RaftOptionsValidated::try_from(RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..RaftOptions::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn timeout_range_must_not_be_empty() {
        let result = RaftOptionsValidated::try_from(RaftOptions {
            follower_min_timeout: Some(Duration::from_millis(800)),
            follower_max_timeout: Some(Duration::from_millis(800)),
            ..RaftOptions::default()
        });
        assert!(result.is_err());
    }
}
