use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::RememberEntitiesStore;
use crate::error::ShardingError;
use crate::persistence::KeyValueStore;
use crate::types::{EntityId, ShardId, TypeName};

/// Attempts per write before a version conflict is surfaced.
const MAX_CAS_ATTEMPTS: u32 = 10;

/// Remembered entities kept as one versioned set per shard in a key/value
/// store, updated with a compare-and-set loop.
pub struct KeyValueRememberEntitiesStore {
    type_name: TypeName,
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueRememberEntitiesStore {
    pub fn new(type_name: TypeName, store: Arc<dyn KeyValueStore>) -> Self {
        Self { type_name, store }
    }

    fn entities_key(&self, shard_id: &ShardId) -> String {
        format!("{}/remember/shard/{}", self.type_name, shard_id)
    }

    fn shards_key(&self) -> String {
        format!("{}/remember/shards", self.type_name)
    }

    async fn read<T>(&self, key: &str) -> Result<(Option<u64>, BTreeSet<T>), ShardingError>
    where
        T: Ord + DeserializeOwned,
    {
        match self.store.get(key).await? {
            Some(v) => Ok((Some(v.version), rmp_serde::from_slice(&v.value)?)),
            None => Ok((None, BTreeSet::new())),
        }
    }

    /// Read-modify-write `key`, retrying on concurrent modification. Skips
    /// the write when `modify` leaves the set unchanged.
    async fn modify<T, F>(&self, key: &str, modify: F) -> Result<(), ShardingError>
    where
        T: Ord + Clone + Serialize + DeserializeOwned + Send + Sync,
        F: Fn(&mut BTreeSet<T>) + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (version, current) = self.read::<T>(key).await?;
            let mut next = current.clone();
            modify(&mut next);
            if next == current && version.is_some() {
                return Ok(());
            }
            let bytes = rmp_serde::to_vec(&next)?;
            match self.store.compare_and_set(key, version, bytes).await {
                Ok(_) => return Ok(()),
                Err(ShardingError::VersionConflict { .. }) if attempt < MAX_CAS_ATTEMPTS => {
                    tracing::debug!(key, attempt, "remember entities write conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl RememberEntitiesStore for KeyValueRememberEntitiesStore {
    async fn add_entity(
        &self,
        shard_id: &ShardId,
        entity_id: &EntityId,
    ) -> Result<(), ShardingError> {
        self.update(shard_id, &BTreeSet::from([entity_id.clone()]), &BTreeSet::new())
            .await
    }

    async fn remove_entity(
        &self,
        shard_id: &ShardId,
        entity_id: &EntityId,
    ) -> Result<(), ShardingError> {
        self.update(shard_id, &BTreeSet::new(), &BTreeSet::from([entity_id.clone()]))
            .await
    }

    async fn get_entities(&self, shard_id: &ShardId) -> Result<BTreeSet<EntityId>, ShardingError> {
        Ok(self.read(&self.entities_key(shard_id)).await?.1)
    }

    async fn update(
        &self,
        shard_id: &ShardId,
        started: &BTreeSet<EntityId>,
        stopped: &BTreeSet<EntityId>,
    ) -> Result<(), ShardingError> {
        self.modify(&self.entities_key(shard_id), |set: &mut BTreeSet<EntityId>| {
            set.extend(started.iter().cloned());
            for id in stopped {
                set.remove(id);
            }
        })
        .await
    }

    async fn get_shards(&self) -> Result<BTreeSet<ShardId>, ShardingError> {
        Ok(self.read(&self.shards_key()).await?.1)
    }

    async fn add_shard(&self, shard_id: &ShardId) -> Result<(), ShardingError> {
        self.modify(&self.shards_key(), |set: &mut BTreeSet<ShardId>| {
            set.insert(shard_id.clone());
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remember::contract;
    use crate::storage::memory_kv::MemoryKeyValueStore;

    fn store() -> (Arc<MemoryKeyValueStore>, KeyValueRememberEntitiesStore) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = KeyValueRememberEntitiesStore::new(TypeName::new("Cart"), kv.clone());
        (kv, store)
    }

    #[tokio::test]
    async fn add_get_remove() {
        contract::add_get_remove(&store().1).await;
    }

    #[tokio::test]
    async fn batch_update() {
        contract::batch_update(&store().1).await;
    }

    #[tokio::test]
    async fn remembered_shards() {
        contract::remembered_shards(&store().1).await;
    }

    #[tokio::test]
    async fn keys_are_partitioned_by_type() {
        let (kv, store) = store();
        store
            .add_entity(&ShardId::new("1"), &EntityId::new("a"))
            .await
            .unwrap();
        assert_eq!(kv.keys(), vec!["Cart/remember/shard/1".to_string()]);
    }

    #[tokio::test]
    async fn write_failures_surface() {
        let (kv, store) = store();
        kv.fail_next_writes(1);
        let err = store
            .add_entity(&ShardId::new("1"), &EntityId::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::PersistenceError { .. }));
        assert!(store.get_entities(&ShardId::new("1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn instances_sharing_a_backend_see_each_other() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let a = KeyValueRememberEntitiesStore::new(TypeName::new("T"), kv.clone());
        let b = KeyValueRememberEntitiesStore::new(TypeName::new("T"), kv);
        a.add_entity(&ShardId::new("1"), &EntityId::new("x")).await.unwrap();
        b.add_entity(&ShardId::new("1"), &EntityId::new("y")).await.unwrap();
        assert_eq!(a.get_entities(&ShardId::new("1")).await.unwrap().len(), 2);
    }
}
