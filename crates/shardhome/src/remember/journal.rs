use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::RememberEntitiesStore;
use crate::error::ShardingError;
use crate::persistence::{EventJournal, Snapshot};
use crate::types::{EntityId, ShardId, TypeName};

#[derive(Debug, Serialize, Deserialize)]
enum EntityEvent {
    Started(BTreeSet<EntityId>),
    Stopped(BTreeSet<EntityId>),
}

#[derive(Debug, Serialize, Deserialize)]
enum ShardEvent {
    ShardAdded(ShardId),
}

/// Remembered entities as an event log per shard, with a snapshot every
/// `snapshot_every` events.
pub struct JournalRememberEntitiesStore {
    type_name: TypeName,
    journal: Arc<dyn EventJournal>,
    snapshot_every: u64,
}

impl JournalRememberEntitiesStore {
    pub fn new(type_name: TypeName, journal: Arc<dyn EventJournal>, snapshot_every: u64) -> Self {
        Self {
            type_name,
            journal,
            snapshot_every: snapshot_every.max(1),
        }
    }

    fn shard_pid(&self, shard_id: &ShardId) -> String {
        format!("{}-remember-shard-{}", self.type_name, shard_id)
    }

    fn shards_pid(&self) -> String {
        format!("{}-remember-shards", self.type_name)
    }

    /// Rebuild a set from the latest snapshot plus newer events.
    async fn load<T, E, F>(&self, pid: &str, apply: F) -> Result<(u64, BTreeSet<T>), ShardingError>
    where
        T: Ord + DeserializeOwned,
        E: DeserializeOwned,
        F: Fn(&mut BTreeSet<T>, E) + Send,
    {
        let (mut seq, mut state) = match self.journal.load_snapshot(pid).await? {
            Some(snapshot) => (
                snapshot.sequence_nr,
                rmp_serde::from_slice(&snapshot.payload)?,
            ),
            None => (0, BTreeSet::new()),
        };
        for entry in self.journal.replay(pid, seq).await? {
            apply(&mut state, rmp_serde::from_slice(&entry.payload)?);
            seq = entry.sequence_nr;
        }
        let highest = self.journal.highest_sequence_nr(pid).await?;
        Ok((seq.max(highest), state))
    }

    async fn persist<T: Serialize + Sync, E: Serialize + Sync>(
        &self,
        pid: &str,
        seq: u64,
        event: &E,
        new_state: &BTreeSet<T>,
    ) -> Result<(), ShardingError> {
        let new_seq = self
            .journal
            .append(pid, seq, vec![rmp_serde::to_vec(event)?])
            .await?;
        if new_seq / self.snapshot_every > seq / self.snapshot_every {
            let snapshot = Snapshot {
                sequence_nr: new_seq,
                payload: rmp_serde::to_vec(new_state)?,
            };
            // The event is durable already; a missing snapshot only costs
            // replay time.
            if let Err(e) = self.journal.save_snapshot(pid, snapshot).await {
                tracing::warn!(pid, error = %e, "failed to save remember entities snapshot");
            }
        }
        Ok(())
    }

    async fn load_entities(&self, pid: &str) -> Result<(u64, BTreeSet<EntityId>), ShardingError> {
        self.load(pid, |set: &mut BTreeSet<EntityId>, event: EntityEvent| match event {
            EntityEvent::Started(ids) => set.extend(ids),
            EntityEvent::Stopped(ids) => {
                for id in ids {
                    set.remove(&id);
                }
            }
        })
        .await
    }

    async fn load_shards(&self, pid: &str) -> Result<(u64, BTreeSet<ShardId>), ShardingError> {
        self.load(pid, |set: &mut BTreeSet<ShardId>, event: ShardEvent| match event {
            ShardEvent::ShardAdded(id) => {
                set.insert(id);
            }
        })
        .await
    }
}

#[async_trait]
impl RememberEntitiesStore for JournalRememberEntitiesStore {
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
        Ok(self.load_entities(&self.shard_pid(shard_id)).await?.1)
    }

    async fn update(
        &self,
        shard_id: &ShardId,
        started: &BTreeSet<EntityId>,
        stopped: &BTreeSet<EntityId>,
    ) -> Result<(), ShardingError> {
        let pid = self.shard_pid(shard_id);
        let (mut seq, mut state) = self.load_entities(&pid).await?;
        if !started.is_empty() {
            state.extend(started.iter().cloned());
            let event = EntityEvent::Started(started.clone());
            self.persist(&pid, seq, &event, &state).await?;
            seq += 1;
        }
        if !stopped.is_empty() {
            for id in stopped {
                state.remove(id);
            }
            let event = EntityEvent::Stopped(stopped.clone());
            self.persist(&pid, seq, &event, &state).await?;
        }
        Ok(())
    }

    async fn get_shards(&self) -> Result<BTreeSet<ShardId>, ShardingError> {
        let pid = self.shards_pid();
        let (_, shards) = self.load_shards(&pid).await?;
        Ok(shards)
    }

    async fn add_shard(&self, shard_id: &ShardId) -> Result<(), ShardingError> {
        let pid = self.shards_pid();
        let (seq, mut shards) = self.load_shards(&pid).await?;
        if !shards.insert(shard_id.clone()) {
            return Ok(());
        }
        self.persist(&pid, seq, &ShardEvent::ShardAdded(shard_id.clone()), &shards)
            .await
    }
}
