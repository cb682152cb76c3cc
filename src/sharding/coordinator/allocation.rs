//! Pluggable shard allocation and rebalancing decisions.

use std::collections::HashSet;

use indexmap::IndexMap;

use super::state::RegionKey;
use crate::sharding::ShardId;

/// Decides where new shards go and which shards to move.
///
/// Implementations must be pure over their inputs: both methods are called
/// from inside the coordinator with its current state and their results are
/// persisted, so reaching for anything else breaks replay.
pub trait AllocationStrategy: Send + Sync {
    /// Picks the region to host `shard` from `current`. `requester` is the
    /// region asking for the home, absent when the coordinator itself is
    /// reallocating. The returned key must be one of `current`'s keys.
    fn allocate(
        &self,
        requester: Option<&RegionKey>,
        shard: &ShardId,
        current: &IndexMap<RegionKey, Vec<ShardId>>,
    ) -> Option<RegionKey>;

    /// Picks shards to move away from their current region. May be empty;
    /// shards already in `rebalance_in_progress` must not be picked again.
    fn rebalance(
        &self,
        current: &IndexMap<RegionKey, Vec<ShardId>>,
        rebalance_in_progress: &HashSet<ShardId>,
    ) -> HashSet<ShardId>;
}

/// The default strategy: new shards go to the region with the fewest
/// allocated shards, and a shard is moved off the most loaded region when
/// it exceeds the least loaded one by at least `rebalance_threshold`.
pub struct LeastShardAllocationStrategy {
    rebalance_threshold: usize,
    max_simultaneous_rebalance: usize,
}

impl LeastShardAllocationStrategy {
    pub fn new(rebalance_threshold: usize, max_simultaneous_rebalance: usize) -> Self {
        Self {
            rebalance_threshold,
            max_simultaneous_rebalance,
        }
    }
}

impl AllocationStrategy for LeastShardAllocationStrategy {
    fn allocate(
        &self,
        _requester: Option<&RegionKey>,
        _shard: &ShardId,
        current: &IndexMap<RegionKey, Vec<ShardId>>,
    ) -> Option<RegionKey> {
        // Ties go to the earliest-registered region, so scan keeping the
        // first strict minimum.
        let mut least: Option<(&RegionKey, usize)> = None;

        for (region, shards) in current {
            if least.map_or(true, |(_, size)| shards.len() < size) {
                least = Some((region, shards.len()));
            }
        }

        least.map(|(region, _)| region.clone())
    }

    fn rebalance(
        &self,
        current: &IndexMap<RegionKey, Vec<ShardId>>,
        rebalance_in_progress: &HashSet<ShardId>,
    ) -> HashSet<ShardId> {
        if rebalance_in_progress.len() >= self.max_simultaneous_rebalance {
            return HashSet::new();
        }

        let Some(least_size) = current.values().map(Vec::len).min() else {
            return HashSet::new();
        };

        // The most loaded region, not counting shards already on the move.
        let mut most: Option<(&Vec<ShardId>, usize)> = None;
        for shards in current.values() {
            let remaining = shards.iter().filter(|s| !rebalance_in_progress.contains(s)).count();

            if most.map_or(true, |(_, size)| remaining > size) {
                most = Some((shards, remaining));
            }
        }

        match most {
            Some((shards, most_size)) if most_size.saturating_sub(least_size) >= self.rebalance_threshold => shards
                .iter()
                .find(|s| !rebalance_in_progress.contains(*s))
                .cloned()
                .into_iter()
                .collect(),
            _ => HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(path: &str) -> RegionKey {
        RegionKey::new(path)
    }

    fn shards(ids: &[&str]) -> Vec<ShardId> {
        ids.iter().map(|id| ShardId::from(*id)).collect()
    }

    #[test]
    fn allocate_prefers_the_least_loaded_region() {
        let strategy = LeastShardAllocationStrategy::new(10, 3);
        let current = IndexMap::from([
            (region("r1"), shards(&["a", "b"])),
            (region("r2"), shards(&["c"])),
            (region("r3"), shards(&["d", "e"])),
        ]);

        let picked = strategy.allocate(None, &ShardId::from("f"), &current);
        assert_eq!(picked, Some(region("r2")));
    }

    #[test]
    fn allocate_breaks_ties_towards_the_first_region() {
        let strategy = LeastShardAllocationStrategy::new(10, 3);
        let current = IndexMap::from([
            (region("r1"), Vec::new()),
            (region("r2"), Vec::new()),
        ]);

        let picked = strategy.allocate(None, &ShardId::from("a"), &current);
        assert_eq!(picked, Some(region("r1")));
    }

    #[test]
    fn allocate_on_no_regions_yields_nothing() {
        let strategy = LeastShardAllocationStrategy::new(10, 3);

        assert_eq!(strategy.allocate(None, &ShardId::from("a"), &IndexMap::new()), None);
    }

    #[test]
    fn rebalance_moves_the_first_shard_of_the_biggest_region() {
        let strategy = LeastShardAllocationStrategy::new(2, 3);
        let current = IndexMap::from([
            (region("r1"), shards(&["a", "b", "c"])),
            (region("r2"), shards(&["d"])),
        ]);

        let picked = strategy.rebalance(&current, &HashSet::new());
        assert_eq!(picked, HashSet::from([ShardId::from("a")]));
    }

    #[test]
    fn rebalance_below_threshold_is_a_no_op() {
        let strategy = LeastShardAllocationStrategy::new(3, 3);
        let current = IndexMap::from([
            (region("r1"), shards(&["a", "b", "c"])),
            (region("r2"), shards(&["d"])),
        ]);

        assert!(strategy.rebalance(&current, &HashSet::new()).is_empty());
    }

    #[test]
    fn rebalance_ignores_shards_already_moving() {
        let strategy = LeastShardAllocationStrategy::new(2, 3);
        let current = IndexMap::from([
            (region("r1"), shards(&["a", "b", "c", "d"])),
            (region("r2"), Vec::new()),
        ]);
        let in_progress = HashSet::from([ShardId::from("a")]);

        let picked = strategy.rebalance(&current, &in_progress);
        assert_eq!(picked, HashSet::from([ShardId::from("b")]));
    }

    #[test]
    fn rebalance_respects_the_concurrency_cap() {
        let strategy = LeastShardAllocationStrategy::new(1, 1);
        let current = IndexMap::from([
            (region("r1"), shards(&["a", "b", "c", "d"])),
            (region("r2"), Vec::new()),
        ]);
        let in_progress = HashSet::from([ShardId::from("a")]);

        assert!(strategy.rebalance(&current, &in_progress).is_empty());
    }
}
