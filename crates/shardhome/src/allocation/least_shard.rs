use std::collections::BTreeSet;

use super::{ShardAllocationStrategy, ShardAllocations};
use crate::types::{RegionAddress, ShardId};

/// Allocates to the region with the fewest shards and rebalances toward an
/// even spread.
///
/// Rebalancing runs in two phases. The first takes every shard above the
/// optimal count (total shards divided by regions, rounded up) from each
/// region. When that finds nothing but some region is still two or more
/// below optimal, the second phase moves one shard from each region at or
/// above optimal. Both are capped per tick by
/// `max(1, min(relative_limit * total, absolute_limit))`.
#[derive(Debug, Clone)]
pub struct LeastShardAllocationStrategy {
    absolute_limit: usize,
    relative_limit: f64,
    rebalance_threshold: usize,
}

impl LeastShardAllocationStrategy {
    pub fn new(absolute_limit: usize, relative_limit: f64, rebalance_threshold: usize) -> Self {
        Self {
            absolute_limit,
            relative_limit,
            rebalance_threshold,
        }
    }

    fn limit(&self, total_shards: usize) -> usize {
        let relative = (self.relative_limit * total_shards as f64).floor() as usize;
        relative.min(self.absolute_limit).max(1)
    }
}

impl Default for LeastShardAllocationStrategy {
    fn default() -> Self {
        Self::new(20, 0.1, 1)
    }
}

impl ShardAllocationStrategy for LeastShardAllocationStrategy {
    fn allocate_shard(
        &self,
        _requester: Option<&RegionAddress>,
        _shard_id: &ShardId,
        allocations: &ShardAllocations,
    ) -> Option<RegionAddress> {
        // BTreeMap order makes ties resolve to the lowest address.
        allocations
            .iter()
            .min_by_key(|(_, shards)| shards.len())
            .map(|(region, _)| region.clone())
    }

    fn rebalance(
        &self,
        allocations: &ShardAllocations,
        in_progress: &BTreeSet<ShardId>,
    ) -> BTreeSet<ShardId> {
        if !in_progress.is_empty() || allocations.len() < 2 {
            return BTreeSet::new();
        }
        let counts = allocations.values().map(Vec::len);
        let max = counts.clone().max().unwrap_or(0);
        let min = counts.min().unwrap_or(0);
        if max - min < self.rebalance_threshold {
            return BTreeSet::new();
        }

        let total: usize = allocations.values().map(Vec::len).sum();
        let optimal = total.div_ceil(allocations.len());
        let limit = self.limit(total);

        // Most loaded first, address order on ties.
        let mut sorted: Vec<(&RegionAddress, &Vec<ShardId>)> = allocations.iter().collect();
        sorted.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(b.0)));

        let phase1: BTreeSet<ShardId> = sorted
            .iter()
            .filter(|(_, shards)| shards.len() > optimal)
            .flat_map(|(_, shards)| shards.iter().take(shards.len() - optimal).cloned())
            .take(limit)
            .collect();
        if !phase1.is_empty() {
            return phase1;
        }

        let below_optimal: usize = sorted
            .iter()
            .map(|(_, shards)| optimal.saturating_sub(1).saturating_sub(shards.len()))
            .sum();
        if below_optimal == 0 {
            return BTreeSet::new();
        }
        sorted
            .iter()
            .filter(|(_, shards)| shards.len() >= optimal)
            .filter_map(|(_, shards)| shards.first().cloned())
            .take(below_optimal.min(limit))
            .collect()
    }
}
