use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ShardingError;
use crate::persistence::{EventJournal, JournalEntry, Snapshot};

/// In-memory event journal with snapshots for testing.
pub struct MemoryEventJournal {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Stream {
    events: Vec<JournalEntry>,
    highest: u64,
    snapshot: Option<Snapshot>,
}

struct Inner {
    streams: HashMap<String, Stream>,
    fail_writes: u32,
}

impl MemoryEventJournal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                fail_writes: 0,
            }),
        }
    }

    /// Make the next `n` appends or snapshot writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.inner.lock().fail_writes = n;
    }

    /// Number of events currently stored for the id.
    pub fn event_count(&self, persistence_id: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(persistence_id)
            .map(|s| s.events.len())
            .unwrap_or(0)
    }

    fn check_write(inner: &mut Inner, persistence_id: &str) -> Result<(), ShardingError> {
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(ShardingError::PersistenceError {
                reason: format!("injected write failure for {persistence_id}"),
                source: None,
            });
        }
        Ok(())
    }
}

impl Default for MemoryEventJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventJournal for MemoryEventJournal {
    async fn append(
        &self,
        persistence_id: &str,
        expected_sequence_nr: u64,
        events: Vec<Vec<u8>>,
    ) -> Result<u64, ShardingError> {
        let mut inner = self.inner.lock();
        Self::check_write(&mut inner, persistence_id)?;
        let stream = inner.streams.entry(persistence_id.to_string()).or_default();
        if stream.highest != expected_sequence_nr {
            return Err(ShardingError::VersionConflict {
                key: persistence_id.to_string(),
                expected: Some(expected_sequence_nr),
                found: Some(stream.highest),
            });
        }
        for payload in events {
            stream.highest += 1;
            stream.events.push(JournalEntry {
                sequence_nr: stream.highest,
                payload,
            });
        }
        Ok(stream.highest)
    }

    async fn replay(
        &self,
        persistence_id: &str,
        after: u64,
    ) -> Result<Vec<JournalEntry>, ShardingError> {
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(persistence_id)
            .map(|s| {
                s.events
                    .iter()
                    .filter(|e| e.sequence_nr > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<u64, ShardingError> {
        Ok(self
            .inner
            .lock()
            .streams
            .get(persistence_id)
            .map(|s| s.highest)
            .unwrap_or(0))
    }

    async fn save_snapshot(
        &self,
        persistence_id: &str,
        snapshot: Snapshot,
    ) -> Result<(), ShardingError> {
        let mut inner = self.inner.lock();
        Self::check_write(&mut inner, persistence_id)?;
        let stream = inner.streams.entry(persistence_id.to_string()).or_default();
        // Events folded into the snapshot are no longer needed for replay.
        stream.events.retain(|e| e.sequence_nr > snapshot.sequence_nr);
        stream.snapshot = Some(snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, persistence_id: &str) -> Result<Option<Snapshot>, ShardingError> {
        Ok(self
            .inner
            .lock()
            .streams
            .get(persistence_id)
            .and_then(|s| s.snapshot.clone()))
    }
}
