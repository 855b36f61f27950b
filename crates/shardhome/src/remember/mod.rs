//! Durable record of which entities were active in each shard.
//!
//! A shard writes through its store before it treats an entity as started
//! or stopped, and reads it back on activation to restart remembered
//! entities without inbound traffic. The coordinator uses the shard-level
//! operations to re-allocate remembered shards after a restart.

mod journal;
mod kv;

pub use journal::JournalRememberEntitiesStore;
pub use kv::KeyValueRememberEntitiesStore;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ShardingError;
use crate::persistence::{EventJournal, KeyValueStore};
use crate::types::{EntityId, ShardId, TypeName};

#[async_trait]
pub trait RememberEntitiesStore: Send + Sync {
    async fn add_entity(&self, shard_id: &ShardId, entity_id: &EntityId)
        -> Result<(), ShardingError>;

    async fn remove_entity(
        &self,
        shard_id: &ShardId,
        entity_id: &EntityId,
    ) -> Result<(), ShardingError>;

    async fn get_entities(&self, shard_id: &ShardId) -> Result<BTreeSet<EntityId>, ShardingError>;

    /// Record a batch of starts and stops for one shard.
    ///
    /// The default implementation applies them one by one; backends should
    /// override it with a single write.
    async fn update(
        &self,
        shard_id: &ShardId,
        started: &BTreeSet<EntityId>,
        stopped: &BTreeSet<EntityId>,
    ) -> Result<(), ShardingError> {
        for entity_id in started {
            self.add_entity(shard_id, entity_id).await?;
        }
        for entity_id in stopped {
            self.remove_entity(shard_id, entity_id).await?;
        }
        Ok(())
    }

    /// Shards that have been allocated while remembering was on.
    async fn get_shards(&self) -> Result<BTreeSet<ShardId>, ShardingError>;

    async fn add_shard(&self, shard_id: &ShardId) -> Result<(), ShardingError>;
}

/// Where a type's remembered entities live.
#[derive(Clone)]
pub enum RememberEntitiesMode {
    /// Replicated key/value store, written with compare-and-set.
    KeyValue(Arc<dyn KeyValueStore>),
    /// Append-only event journal with snapshots.
    Journal(Arc<dyn EventJournal>),
    /// Any user-supplied store.
    Custom(Arc<dyn RememberEntitiesStore>),
}

impl std::fmt::Debug for RememberEntitiesMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RememberEntitiesMode::KeyValue(_) => f.write_str("KeyValue"),
            RememberEntitiesMode::Journal(_) => f.write_str("Journal"),
            RememberEntitiesMode::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl RememberEntitiesMode {
    pub(crate) fn open(
        &self,
        type_name: &TypeName,
        snapshot_every: u64,
    ) -> Arc<dyn RememberEntitiesStore> {
        match self {
            RememberEntitiesMode::KeyValue(store) => Arc::new(
                KeyValueRememberEntitiesStore::new(type_name.clone(), Arc::clone(store)),
            ),
            RememberEntitiesMode::Journal(journal) => Arc::new(
                JournalRememberEntitiesStore::new(
                    type_name.clone(),
                    Arc::clone(journal),
                    snapshot_every,
                ),
            ),
            RememberEntitiesMode::Custom(store) => Arc::clone(store),
        }
    }
}
