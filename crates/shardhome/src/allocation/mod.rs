//! Shard allocation and rebalance decisions.
//!
//! Strategies are pure: the coordinator hands them the current allocation
//! of every region eligible to host shards and acts on what they return.

mod consistent_hash;
mod least_shard;

pub use consistent_hash::ConsistentHashAllocationStrategy;
pub use least_shard::LeastShardAllocationStrategy;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::AllocationStrategyConfig;
use crate::types::{RegionAddress, ShardId};

/// Shards owned by each live hosting region. Regions with no shards are
/// present with an empty list.
pub type ShardAllocations = BTreeMap<RegionAddress, Vec<ShardId>>;

pub trait ShardAllocationStrategy: Send + Sync {
    /// Pick the region for a shard that has no home. `requester` is the
    /// region that asked for it, if any. Must return a key of `allocations`,
    /// or `None` when there is nothing to choose from.
    fn allocate_shard(
        &self,
        requester: Option<&RegionAddress>,
        shard_id: &ShardId,
        allocations: &ShardAllocations,
    ) -> Option<RegionAddress>;

    /// Shards to move away from their current region this tick.
    /// `in_progress` holds shards whose handoff has not completed yet.
    fn rebalance(
        &self,
        allocations: &ShardAllocations,
        in_progress: &BTreeSet<ShardId>,
    ) -> BTreeSet<ShardId>;
}

/// Build one of the built-in strategies.
pub fn from_config(config: &AllocationStrategyConfig) -> Arc<dyn ShardAllocationStrategy> {
    match config {
        AllocationStrategyConfig::LeastShard {
            absolute_limit,
            relative_limit,
            rebalance_threshold,
        } => Arc::new(LeastShardAllocationStrategy::new(
            *absolute_limit,
            *relative_limit,
            *rebalance_threshold,
        )),
        AllocationStrategyConfig::ConsistentHashing {
            virtual_nodes,
            absolute_limit,
        } => Arc::new(ConsistentHashAllocationStrategy::new(
            *virtual_nodes,
            *absolute_limit,
        )),
    }
}

#[cfg(test)]
pub(crate) fn allocations(entries: &[(u16, &[&str])]) -> ShardAllocations {
    entries
        .iter()
        .map(|(port, shards)| {
            (
                RegionAddress::new("127.0.0.1", *port),
                shards.iter().map(|s| ShardId::new(*s)).collect(),
            )
        })
        .collect()
}
