//! The configuration block for sharding.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Settings for one sharding node, mirroring the deployment's sharding
/// configuration block. All fields are public so a deployment can either
/// deserialize the block from its configuration source or build it in code
/// starting from [`ShardingSettings::default`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ShardingSettings {
    /// Name of the registry guardian; region and coordinator paths are
    /// formed under it.
    pub guardian_name: String,
    /// Default role gating which nodes host the coordinator and entries.
    /// A start call may override it per entry type.
    pub role: Option<String>,
    /// Delay before the supervisor restarts a coordinator that stopped on
    /// a persistence failure.
    pub coordinator_failure_backoff: Duration,
    /// Cadence at which a region retries coordinator registration and
    /// re-requests homes for buffered shards.
    pub retry_interval: Duration,
    /// Cap on buffered messages, summed across shards, per region and per
    /// shard. Messages beyond it go to dead letters.
    pub buffer_size: usize,
    /// Time a rebalance worker waits for a full handoff before reporting
    /// failure.
    pub handoff_timeout: Duration,
    /// Delay before the coordinator re-sends a `HostShard` that was not
    /// acknowledged with `ShardStarted`.
    pub shard_start_timeout: Duration,
    /// Delay before a shard retries a failed persistence write.
    pub shard_failure_backoff: Duration,
    /// Delay before a remembered entry that stopped without passivation is
    /// restarted.
    pub entry_restart_backoff: Duration,
    /// Coordinator rebalance tick.
    pub rebalance_interval: Duration,
    /// Snapshot tick for the coordinator and for remembering shards.
    pub snapshot_interval: Duration,
    /// Difference in shard counts between the most and least loaded
    /// regions at which the default strategy starts rebalancing.
    pub least_shard_rebalance_threshold: usize,
    /// Cap on concurrently rebalancing shards for the default strategy.
    pub least_shard_max_simultaneous_rebalance: usize,
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            guardian_name: constants::DEFAULT_GUARDIAN_NAME.to_owned(),
            role: None,
            coordinator_failure_backoff: constants::DEFAULT_COORDINATOR_FAILURE_BACKOFF,
            retry_interval: constants::DEFAULT_RETRY_INTERVAL,
            buffer_size: constants::DEFAULT_BUFFER_SIZE,
            handoff_timeout: constants::DEFAULT_HANDOFF_TIMEOUT,
            shard_start_timeout: constants::DEFAULT_SHARD_START_TIMEOUT,
            shard_failure_backoff: constants::DEFAULT_SHARD_FAILURE_BACKOFF,
            entry_restart_backoff: constants::DEFAULT_ENTRY_RESTART_BACKOFF,
            rebalance_interval: constants::DEFAULT_REBALANCE_INTERVAL,
            snapshot_interval: constants::DEFAULT_SNAPSHOT_INTERVAL,
            least_shard_rebalance_threshold: constants::DEFAULT_REBALANCE_THRESHOLD,
            least_shard_max_simultaneous_rebalance: constants::DEFAULT_MAX_SIMULTANEOUS_REBALANCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_configuration_falls_back_to_defaults() {
        let settings: ShardingSettings = serde_json::from_str(
            r#"{"role": "entries", "buffer_size": 16, "retry_interval": {"secs": 1, "nanos": 0}}"#,
        )
        .unwrap();

        assert_eq!(settings.role.as_deref(), Some("entries"));
        assert_eq!(settings.buffer_size, 16);
        assert_eq!(settings.retry_interval, Duration::from_secs(1));
        assert_eq!(settings.guardian_name, constants::DEFAULT_GUARDIAN_NAME);
        assert_eq!(settings.handoff_timeout, constants::DEFAULT_HANDOFF_TIMEOUT);
    }
}
