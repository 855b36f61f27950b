//! Durable storage collaborators.
//!
//! Two shapes are supported: a versioned key/value store with
//! compare-and-set (replicated-data style) and an append-only event journal
//! with snapshots. Coordinator state and remembered entities can each use
//! either one.

use async_trait::async_trait;

use crate::error::ShardingError;

/// A value together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, ShardingError>;

    /// Write `value` only if the stored version equals `expected` (`None`
    /// meaning the key is absent). Returns the new version, or
    /// `VersionConflict` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<u64, ShardingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence_nr: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Highest event sequence number folded into `payload`.
    pub sequence_nr: u64,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Append events after `expected_sequence_nr`. Fails with
    /// `VersionConflict` if the journal has moved past it. Returns the new
    /// highest sequence number. Sequence numbers start at 1.
    async fn append(
        &self,
        persistence_id: &str,
        expected_sequence_nr: u64,
        events: Vec<Vec<u8>>,
    ) -> Result<u64, ShardingError>;

    /// Events with `sequence_nr > after`, in order.
    async fn replay(
        &self,
        persistence_id: &str,
        after: u64,
    ) -> Result<Vec<JournalEntry>, ShardingError>;

    async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<u64, ShardingError>;

    async fn save_snapshot(
        &self,
        persistence_id: &str,
        snapshot: Snapshot,
    ) -> Result<(), ShardingError>;

    async fn load_snapshot(&self, persistence_id: &str) -> Result<Option<Snapshot>, ShardingError>;
}
