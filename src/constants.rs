//! A set of constants used by the library.

use std::time::Duration;

/// The name of the registry guardian under which regions and coordinator
/// singletons are placed, unless overridden in the settings.
pub const DEFAULT_GUARDIAN_NAME: &str = "sharding";
/// Default cap on buffered messages, summed across shards, for a region and
/// for a shard.
pub const DEFAULT_BUFFER_SIZE: usize = 100_000;
/// Default cadence at which a region retries coordinator registration and
/// re-requests homes for buffered shards.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
/// Default time a rebalance worker waits for a complete handoff before
/// giving up on it.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(60);
/// Default delay before the coordinator re-sends an unacknowledged
/// `HostShard`.
pub const DEFAULT_SHARD_START_TIMEOUT: Duration = Duration::from_secs(10);
/// Default restart delay of the coordinator supervisor.
pub const DEFAULT_COORDINATOR_FAILURE_BACKOFF: Duration = Duration::from_secs(10);
/// Default delay before a shard retries a failed persistence write.
pub const DEFAULT_SHARD_FAILURE_BACKOFF: Duration = Duration::from_secs(10);
/// Default delay before a remembered entry that stopped without passivation
/// is restarted.
pub const DEFAULT_ENTRY_RESTART_BACKOFF: Duration = Duration::from_secs(10);
/// Default coordinator rebalance tick.
pub const DEFAULT_REBALANCE_INTERVAL: Duration = Duration::from_secs(10);
/// Default snapshot tick of the coordinator and of remembering shards.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(3600);
/// Default difference in shard counts between the most and least loaded
/// regions that triggers a rebalance.
pub const DEFAULT_REBALANCE_THRESHOLD: usize = 10;
/// Default cap on concurrently rebalancing shards.
pub const DEFAULT_MAX_SIMULTANEOUS_REBALANCE: usize = 3;
/// The path element naming a coordinator singleton instance.
pub const SINGLETON_NAME: &str = "singleton";
