use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ShardingError;
use crate::persistence::{KeyValueStore, Versioned};

/// In-memory versioned key/value store for testing.
pub struct MemoryKeyValueStore {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, Versioned>,
    fail_writes: u32,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                fail_writes: 0,
            }),
        }
    }

    /// Make the next `n` writes fail with a persistence error.
    pub fn fail_next_writes(&self, n: u32) {
        self.inner.lock().fail_writes = n;
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_write(inner: &mut Inner, key: &str) -> Result<(), ShardingError> {
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(ShardingError::PersistenceError {
                reason: format!("injected write failure for {key}"),
                source: None,
            });
        }
        Ok(())
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, ShardingError> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<u64, ShardingError> {
        let mut inner = self.inner.lock();
        Self::check_write(&mut inner, key)?;
        let found = inner.entries.get(key).map(|v| v.version);
        if found != expected {
            return Err(ShardingError::VersionConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }
        let version = found.unwrap_or(0) + 1;
        inner
            .entries
            .insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }
}
