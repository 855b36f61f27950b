use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ShardingError;
use crate::types::{RegionAddress, ShardId, TypeName};

/// Invoked when a held lease is lost outside of `release`, with an optional
/// reason from the backend.
pub type LeaseLostCallback = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Mutual-exclusion lease backend.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Try to take the lease for `owner`. `Ok(false)` means another owner
    /// holds it. `on_lost` fires if the lease is later lost.
    async fn acquire(
        &self,
        lease_id: &str,
        owner: &str,
        on_lost: LeaseLostCallback,
    ) -> Result<bool, ShardingError>;

    /// Give the lease up. Returns whether `owner` held it.
    async fn release(&self, lease_id: &str, owner: &str) -> Result<bool, ShardingError>;
}

/// Lease id for one shard of one type.
pub fn shard_lease_id(type_name: &TypeName, shard_id: &ShardId) -> String {
    format!("{type_name}-shard-{type_name}-{shard_id}")
}

/// The lease a single shard must hold before hosting entities.
#[derive(Clone)]
pub(crate) struct LeaseGuard {
    provider: Arc<dyn LeaseProvider>,
    lease_id: String,
    owner: String,
}

impl LeaseGuard {
    pub(crate) fn new(
        provider: Arc<dyn LeaseProvider>,
        type_name: &TypeName,
        shard_id: &ShardId,
        owner: &RegionAddress,
    ) -> Self {
        Self {
            provider,
            lease_id: shard_lease_id(type_name, shard_id),
            owner: owner.to_string(),
        }
    }

    pub(crate) fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// One acquisition attempt. Errors from the backend count as a failed
    /// attempt.
    pub(crate) async fn try_acquire(&self, on_lost: LeaseLostCallback) -> bool {
        match self.provider.acquire(&self.lease_id, &self.owner, on_lost).await {
            Ok(true) => {
                tracing::debug!(lease_id = %self.lease_id, "lease acquired");
                true
            }
            Ok(false) => {
                tracing::debug!(lease_id = %self.lease_id, "lease held elsewhere");
                false
            }
            Err(e) => {
                tracing::warn!(lease_id = %self.lease_id, error = %e, "lease acquisition failed");
                false
            }
        }
    }

    pub(crate) async fn release(&self) {
        match self.provider.release(&self.lease_id, &self.owner).await {
            Ok(true) => tracing::debug!(lease_id = %self.lease_id, "lease released"),
            Ok(false) => tracing::debug!(lease_id = %self.lease_id, "lease was not held on release"),
            Err(e) => {
                tracing::warn!(lease_id = %self.lease_id, error = %e, "lease release failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_lease::MemoryLeaseProvider;

    #[test]
    fn lease_id_format() {
        assert_eq!(
            shard_lease_id(&TypeName::new("Cart"), &ShardId::new("4")),
            "Cart-shard-Cart-4"
        );
    }

    #[tokio::test]
    async fn guard_counts_rejections_as_failures() {
        let provider = Arc::new(MemoryLeaseProvider::new());
        let guard = LeaseGuard::new(
            provider.clone(),
            &TypeName::new("T"),
            &ShardId::new("1"),
            &RegionAddress::new("a", 1),
        );
        provider.reject_next(1);
        assert!(!guard.try_acquire(Arc::new(|_| {})).await);
        assert!(guard.try_acquire(Arc::new(|_| {})).await);
        assert_eq!(provider.holder(guard.lease_id()), Some("a:1".to_string()));
        guard.release().await;
        assert_eq!(provider.holder(guard.lease_id()), None);
    }
}
