use std::collections::BTreeSet;

use hashring::HashRing;

use super::{ShardAllocationStrategy, ShardAllocations};
use crate::types::{RegionAddress, ShardId};

/// One virtual node of a region on the ring.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct RegionNode {
    address: RegionAddress,
    replica: usize,
}

/// Places each shard on the region its id hashes to.
///
/// Adding or removing a region only moves the shards that hash to it.
/// Rebalance moves shards that are not where the ring says, at most
/// `absolute_limit` in flight at a time.
#[derive(Debug, Clone)]
pub struct ConsistentHashAllocationStrategy {
    virtual_nodes: usize,
    absolute_limit: usize,
}

impl ConsistentHashAllocationStrategy {
    pub fn new(virtual_nodes: usize, absolute_limit: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            absolute_limit,
        }
    }

    fn ring(&self, allocations: &ShardAllocations) -> HashRing<RegionNode> {
        let mut ring = HashRing::new();
        for address in allocations.keys() {
            for replica in 0..self.virtual_nodes {
                ring.add(RegionNode {
                    address: address.clone(),
                    replica,
                });
            }
        }
        ring
    }
}

impl ShardAllocationStrategy for ConsistentHashAllocationStrategy {
    fn allocate_shard(
        &self,
        _requester: Option<&RegionAddress>,
        shard_id: &ShardId,
        allocations: &ShardAllocations,
    ) -> Option<RegionAddress> {
        if allocations.is_empty() {
            return None;
        }
        self.ring(allocations)
            .get(&shard_id.as_ref())
            .map(|node| node.address.clone())
    }

    fn rebalance(
        &self,
        allocations: &ShardAllocations,
        in_progress: &BTreeSet<ShardId>,
    ) -> BTreeSet<ShardId> {
        let budget = self.absolute_limit.saturating_sub(in_progress.len());
        if budget == 0 || allocations.len() < 2 {
            return BTreeSet::new();
        }
        let ring = self.ring(allocations);
        allocations
            .iter()
            .flat_map(|(region, shards)| shards.iter().map(move |s| (region, s)))
            .filter(|(_, shard)| !in_progress.contains(*shard))
            .filter(|(region, shard)| {
                ring.get(&shard.as_ref())
                    .is_some_and(|node| &node.address != *region)
            })
            .map(|(_, shard)| shard.clone())
            .take(budget)
            .collect()
    }
}
