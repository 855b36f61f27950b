use std::sync::Arc;

use async_trait::async_trait;

use super::state::{CoordinatorEvent, CoordinatorState};
use crate::error::ShardingError;
use crate::persistence::{EventJournal, KeyValueStore, Snapshot};
use crate::types::TypeName;

/// Durable home of the allocation table.
///
/// `persist` must either commit the whole write or fail; the coordinator
/// applies an event only after it returns `Ok`.
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// Read the latest state, resetting any cached write position.
    async fn load(&mut self) -> Result<CoordinatorState, ShardingError>;

    async fn persist(
        &mut self,
        event: &CoordinatorEvent,
        new_state: &CoordinatorState,
    ) -> Result<(), ShardingError>;
}

/// Where a type's coordinator state is kept.
#[derive(Clone)]
pub enum StateStoreMode {
    /// Whole state under one key, written with compare-and-set.
    KeyValue(Arc<dyn KeyValueStore>),
    /// Events in a journal with periodic snapshots.
    Journal(Arc<dyn EventJournal>),
}

impl std::fmt::Debug for StateStoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateStoreMode::KeyValue(_) => f.write_str("KeyValue"),
            StateStoreMode::Journal(_) => f.write_str("Journal"),
        }
    }
}

impl StateStoreMode {
    pub(crate) fn open(&self, type_name: &TypeName, snapshot_every: u64) -> Box<dyn CoordinatorStore> {
        match self {
            StateStoreMode::KeyValue(store) => Box::new(KeyValueCoordinatorStore::new(
                type_name,
                Arc::clone(store),
            )),
            StateStoreMode::Journal(journal) => Box::new(JournalCoordinatorStore::new(
                type_name,
                Arc::clone(journal),
                snapshot_every,
            )),
        }
    }
}

pub struct KeyValueCoordinatorStore {
    key: String,
    store: Arc<dyn KeyValueStore>,
    version: Option<u64>,
}

impl KeyValueCoordinatorStore {
    pub fn new(type_name: &TypeName, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            key: format!("{type_name}/coordinator"),
            store,
            version: None,
        }
    }
}

#[async_trait]
impl CoordinatorStore for KeyValueCoordinatorStore {
    async fn load(&mut self) -> Result<CoordinatorState, ShardingError> {
        match self.store.get(&self.key).await? {
            Some(v) => {
                self.version = Some(v.version);
                Ok(rmp_serde::from_slice(&v.value)?)
            }
            None => {
                self.version = None;
                Ok(CoordinatorState::default())
            }
        }
    }

    async fn persist(
        &mut self,
        _event: &CoordinatorEvent,
        new_state: &CoordinatorState,
    ) -> Result<(), ShardingError> {
        let bytes = rmp_serde::to_vec(new_state)?;
        let version = self
            .store
            .compare_and_set(&self.key, self.version, bytes)
            .await?;
        self.version = Some(version);
        Ok(())
    }
}

pub struct JournalCoordinatorStore {
    persistence_id: String,
    journal: Arc<dyn EventJournal>,
    snapshot_every: u64,
    sequence_nr: u64,
}

impl JournalCoordinatorStore {
    pub fn new(type_name: &TypeName, journal: Arc<dyn EventJournal>, snapshot_every: u64) -> Self {
        Self {
            persistence_id: format!("{type_name}-coordinator"),
            journal,
            snapshot_every: snapshot_every.max(1),
            sequence_nr: 0,
        }
    }
}

#[async_trait]
impl CoordinatorStore for JournalCoordinatorStore {
    async fn load(&mut self) -> Result<CoordinatorState, ShardingError> {
        let (mut seq, mut state) = match self.journal.load_snapshot(&self.persistence_id).await? {
            Some(snapshot) => (
                snapshot.sequence_nr,
                rmp_serde::from_slice(&snapshot.payload)?,
            ),
            None => (0, CoordinatorState::default()),
        };
        for entry in self.journal.replay(&self.persistence_id, seq).await? {
            let event: CoordinatorEvent = rmp_serde::from_slice(&entry.payload)?;
            state = state.updated(&event)?;
            seq = entry.sequence_nr;
        }
        self.sequence_nr = seq.max(self.journal.highest_sequence_nr(&self.persistence_id).await?);
        Ok(state)
    }

    async fn persist(
        &mut self,
        event: &CoordinatorEvent,
        new_state: &CoordinatorState,
    ) -> Result<(), ShardingError> {
        let previous = self.sequence_nr;
        self.sequence_nr = self
            .journal
            .append(
                &self.persistence_id,
                previous,
                vec![rmp_serde::to_vec(event)?],
            )
            .await?;
        if self.sequence_nr / self.snapshot_every > previous / self.snapshot_every {
            let snapshot = Snapshot {
                sequence_nr: self.sequence_nr,
                payload: rmp_serde::to_vec(new_state)?,
            };
            if let Err(e) = self.journal.save_snapshot(&self.persistence_id, snapshot).await {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    error = %e,
                    "failed to save coordinator snapshot"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_journal::MemoryEventJournal;
    use crate::storage::memory_kv::MemoryKeyValueStore;
    use crate::types::{RegionAddress, ShardId};

    fn events() -> Vec<CoordinatorEvent> {
        let a = RegionAddress::new("a", 1);
        let b = RegionAddress::new("b", 1);
        let mut events = vec![
            CoordinatorEvent::RegionRegistered { region: a.clone() },
            CoordinatorEvent::RegionRegistered { region: b.clone() },
            CoordinatorEvent::RegionProxyRegistered {
                proxy: RegionAddress::new("p", 1),
            },
        ];
        for i in 0..10 {
            events.push(CoordinatorEvent::ShardHomeAllocated {
                shard_id: ShardId::new(i.to_string()),
                region: if i % 2 == 0 { a.clone() } else { b.clone() },
            });
        }
        events.push(CoordinatorEvent::ShardHomeDeallocated {
            shard_id: ShardId::new("3"),
        });
        events.push(CoordinatorEvent::RegionTerminated { region: a });
        events
    }

    async fn persist_all(store: &mut dyn CoordinatorStore) -> CoordinatorState {
        let mut state = store.load().await.unwrap();
        for event in events() {
            let next = state.updated(&event).unwrap();
            store.persist(&event, &next).await.unwrap();
            state = next;
        }
        state
    }

    #[tokio::test]
    async fn kv_store_round_trips_state() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let mut store = KeyValueCoordinatorStore::new(&TypeName::new("T"), kv.clone());
        let expected = persist_all(&mut store).await;

        let mut reloaded = KeyValueCoordinatorStore::new(&TypeName::new("T"), kv);
        assert_eq!(reloaded.load().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn kv_store_detects_concurrent_writer() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let mut first = KeyValueCoordinatorStore::new(&TypeName::new("T"), kv.clone());
        let mut second = KeyValueCoordinatorStore::new(&TypeName::new("T"), kv);
        first.load().await.unwrap();
        second.load().await.unwrap();

        let event = CoordinatorEvent::RegionRegistered {
            region: RegionAddress::new("a", 1),
        };
        let state = CoordinatorState::default().updated(&event).unwrap();
        first.persist(&event, &state).await.unwrap();
        assert!(matches!(
            second.persist(&event, &state).await,
            Err(ShardingError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn journal_store_replays_over_snapshot() {
        let journal = Arc::new(MemoryEventJournal::new());
        let mut store = JournalCoordinatorStore::new(&TypeName::new("T"), journal.clone(), 4);
        let expected = persist_all(&mut store).await;
        assert!(journal.load_snapshot("T-coordinator").await.unwrap().is_some());
        assert!(journal.event_count("T-coordinator") < events().len());

        let mut reloaded = JournalCoordinatorStore::new(&TypeName::new("T"), journal, 4);
        assert_eq!(reloaded.load().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn journal_store_rejects_corrupt_log() {
        let journal = Arc::new(MemoryEventJournal::new());
        let bad = CoordinatorEvent::ShardHomeAllocated {
            shard_id: ShardId::new("1"),
            region: RegionAddress::new("nowhere", 1),
        };
        journal
            .append("T-coordinator", 0, vec![rmp_serde::to_vec(&bad).unwrap()])
            .await
            .unwrap();
        let mut store = JournalCoordinatorStore::new(&TypeName::new("T"), journal, 100);
        assert!(matches!(
            store.load().await,
            Err(ShardingError::CorruptState { .. })
        ));
    }
}
