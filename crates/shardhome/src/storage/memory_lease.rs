use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ShardingError;
use crate::lease::{LeaseLostCallback, LeaseProvider};

/// In-memory lease backend for testing.
pub struct MemoryLeaseProvider {
    inner: Mutex<Inner>,
}

struct Held {
    owner: String,
    on_lost: LeaseLostCallback,
}

struct Inner {
    leases: HashMap<String, Held>,
    reject: u32,
    attempts: HashMap<String, u32>,
}

impl MemoryLeaseProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                leases: HashMap::new(),
                reject: 0,
                attempts: HashMap::new(),
            }),
        }
    }

    /// Refuse the next `n` acquisitions regardless of lease state.
    pub fn reject_next(&self, n: u32) {
        self.inner.lock().reject = n;
    }

    pub fn holder(&self, lease_id: &str) -> Option<String> {
        self.inner.lock().leases.get(lease_id).map(|h| h.owner.clone())
    }

    /// Acquisition attempts seen for a lease, including rejected ones.
    pub fn attempts(&self, lease_id: &str) -> u32 {
        self.inner.lock().attempts.get(lease_id).copied().unwrap_or(0)
    }

    /// Take the lease away from its holder and fire its lost callback.
    pub fn revoke(&self, lease_id: &str) {
        let held = self.inner.lock().leases.remove(lease_id);
        if let Some(held) = held {
            (held.on_lost)(Some("revoked".to_string()));
        }
    }
}

impl Default for MemoryLeaseProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseProvider for MemoryLeaseProvider {
    async fn acquire(
        &self,
        lease_id: &str,
        owner: &str,
        on_lost: LeaseLostCallback,
    ) -> Result<bool, ShardingError> {
        let mut inner = self.inner.lock();
        *inner.attempts.entry(lease_id.to_string()).or_insert(0) += 1;
        if inner.reject > 0 {
            inner.reject -= 1;
            return Ok(false);
        }
        match inner.leases.get_mut(lease_id) {
            Some(held) if held.owner != owner => Ok(false),
            Some(held) => {
                held.on_lost = on_lost;
                Ok(true)
            }
            None => {
                inner.leases.insert(
                    lease_id.to_string(),
                    Held {
                        owner: owner.to_string(),
                        on_lost,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, lease_id: &str, owner: &str) -> Result<bool, ShardingError> {
        let mut inner = self.inner.lock();
        match inner.leases.get(lease_id) {
            Some(held) if held.owner == owner => {
                inner.leases.remove(lease_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
