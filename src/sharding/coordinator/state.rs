//! The coordinator's persistent state and the domain events folding into
//! it.
//!
//! Regions appear in the persistent state as [`RegionKey`]s (their logical
//! paths), never as live handles; the coordinator keeps the key-to-handle
//! resolution next to the state. This is what lets events and snapshots
//! round-trip through the journal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::sharding::ShardId;

/// A region's logical path, the keyed handle regions are known by in
/// persistent state.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey(Arc<str>);

impl RegionKey {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionKey({})", self.0)
    }
}

impl Serialize for RegionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RegionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|path| Self(Arc::from(path.as_str())))
    }
}

/// The domain events of the coordinator's log. Every state mutation is one
/// of these, applied through [`CoordinatorState::updated`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum CoordinatorEvent {
    ShardRegionRegistered { region: RegionKey },
    ShardRegionProxyRegistered { region: RegionKey },
    ShardRegionTerminated { region: RegionKey },
    ShardRegionProxyTerminated { region: RegionKey },
    ShardHomeAllocated { shard: ShardId, region: RegionKey },
    ShardHomeDeallocated { shard: ShardId },
}

/// The authoritative shard-to-region mapping.
///
/// `regions` is insertion-ordered and its per-region lists are
/// append-ordered; allocation tie-breaking and the rebalance pick depend on
/// both.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct CoordinatorState {
    pub shards: HashMap<ShardId, RegionKey>,
    pub regions: IndexMap<RegionKey, Vec<ShardId>>,
    pub region_proxies: HashSet<RegionKey>,
    pub unallocated_shards: BTreeSet<ShardId>,
}

impl CoordinatorState {
    /// Pure fold: the state after applying `event`. Replay and
    /// snapshot-then-replay agree because nothing else ever mutates state.
    pub fn updated(&self, event: &CoordinatorEvent) -> Self {
        let mut next = self.clone();

        match event {
            CoordinatorEvent::ShardRegionRegistered { region } => {
                next.regions.entry(region.clone()).or_default();
            },
            CoordinatorEvent::ShardRegionProxyRegistered { region } => {
                next.region_proxies.insert(region.clone());
            },
            CoordinatorEvent::ShardRegionTerminated { region } => {
                if let Some(shards) = next.regions.shift_remove(region) {
                    for shard in shards {
                        next.shards.remove(&shard);
                        next.unallocated_shards.insert(shard);
                    }
                }
            },
            CoordinatorEvent::ShardRegionProxyTerminated { region } => {
                next.region_proxies.remove(region);
            },
            CoordinatorEvent::ShardHomeAllocated { shard, region } => {
                next.shards.insert(shard.clone(), region.clone());
                next.regions.entry(region.clone()).or_default().push(shard.clone());
                next.unallocated_shards.remove(shard);
            },
            CoordinatorEvent::ShardHomeDeallocated { shard } => {
                if let Some(region) = next.shards.remove(shard) {
                    if let Some(shards) = next.regions.get_mut(&region) {
                        shards.retain(|s| s != shard);
                    }
                }
                next.unallocated_shards.insert(shard.clone());
            },
        }

        next
    }
}
