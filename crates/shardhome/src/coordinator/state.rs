use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::allocation::ShardAllocations;
use crate::error::ShardingError;
use crate::types::{RegionAddress, ShardId};

/// A change to the allocation table. Persisted before it is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorEvent {
    RegionRegistered { region: RegionAddress },
    RegionProxyRegistered { proxy: RegionAddress },
    RegionTerminated { region: RegionAddress },
    RegionProxyTerminated { proxy: RegionAddress },
    ShardHomeAllocated {
        shard_id: ShardId,
        region: RegionAddress,
    },
    ShardHomeDeallocated { shard_id: ShardId },
}

/// The authoritative allocation table of one type.
///
/// `shards` and `regions` are two views of the same mapping and are kept in
/// step by [`CoordinatorState::updated`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub shards: BTreeMap<ShardId, RegionAddress>,
    pub regions: BTreeMap<RegionAddress, BTreeSet<ShardId>>,
    pub proxies: BTreeSet<RegionAddress>,
}

impl CoordinatorState {
    /// The state after `event`, or `CorruptState` if the event does not fit.
    pub fn updated(&self, event: &CoordinatorEvent) -> Result<Self, ShardingError> {
        let mut next = self.clone();
        match event {
            CoordinatorEvent::RegionRegistered { region } => {
                if next.regions.contains_key(region) {
                    return Err(corrupt(format!("region {region} already registered")));
                }
                next.regions.insert(region.clone(), BTreeSet::new());
            }
            CoordinatorEvent::RegionProxyRegistered { proxy } => {
                if !next.proxies.insert(proxy.clone()) {
                    return Err(corrupt(format!("proxy {proxy} already registered")));
                }
            }
            CoordinatorEvent::RegionTerminated { region } => {
                let Some(shards) = next.regions.remove(region) else {
                    return Err(corrupt(format!("terminated region {region} not registered")));
                };
                for shard in shards {
                    next.shards.remove(&shard);
                }
            }
            CoordinatorEvent::RegionProxyTerminated { proxy } => {
                if !next.proxies.remove(proxy) {
                    return Err(corrupt(format!("terminated proxy {proxy} not registered")));
                }
            }
            CoordinatorEvent::ShardHomeAllocated { shard_id, region } => {
                if next.shards.contains_key(shard_id) {
                    return Err(corrupt(format!("shard {shard_id} already allocated")));
                }
                let Some(owned) = next.regions.get_mut(region) else {
                    return Err(corrupt(format!(
                        "shard {shard_id} allocated to unknown region {region}"
                    )));
                };
                owned.insert(shard_id.clone());
                next.shards.insert(shard_id.clone(), region.clone());
            }
            CoordinatorEvent::ShardHomeDeallocated { shard_id } => {
                let Some(region) = next.shards.remove(shard_id) else {
                    return Err(corrupt(format!("shard {shard_id} not allocated")));
                };
                if let Some(owned) = next.regions.get_mut(&region) {
                    owned.remove(shard_id);
                }
            }
        }
        Ok(next)
    }

    /// Allocations of the regions accepted by `eligible`.
    pub fn allocations(&self, eligible: impl Fn(&RegionAddress) -> bool) -> ShardAllocations {
        self.regions
            .iter()
            .filter(|(region, _)| eligible(region))
            .map(|(region, shards)| (region.clone(), shards.iter().cloned().collect()))
            .collect()
    }
}

fn corrupt(reason: String) -> ShardingError {
    ShardingError::CorruptState { reason }
}
