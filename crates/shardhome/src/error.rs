use crate::types::{EntityId, RegionAddress, ShardId};
use serde::{Deserialize, Serialize};

/// Errors that can occur in the sharding system.
#[derive(Debug, thiserror::Error)]
pub enum ShardingError {
    #[error("buffer for shard {shard_id} is full (capacity {capacity})")]
    BufferOverflow { shard_id: ShardId, capacity: usize },

    #[error("message not handled: {reason}")]
    Unhandled { reason: String },

    #[error("no home for shard {shard_id} after {attempts} attempts")]
    ShardHomeUnavailable { shard_id: ShardId, attempts: u32 },

    #[error("entity {entity_id} failed: {reason}")]
    EntityFailure { entity_id: EntityId, reason: String },

    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("corrupt coordinator state: {reason}")]
    CorruptState { reason: String },

    #[error("lease error: {reason}")]
    LeaseError { reason: String },

    #[error("region unavailable: {address}")]
    RegionUnavailable {
        address: RegionAddress,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("coordinator unavailable")]
    CoordinatorUnavailable,

    #[error("reply channel dropped")]
    ReplyDropped,

    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("sharding is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl ShardingError {
    pub(crate) fn persistence(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ShardingError::PersistenceError {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<rmp_serde::encode::Error> for ShardingError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ShardingError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for ShardingError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ShardingError::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Failure carried back to a remote sender inside a reply message.
///
/// `ShardingError` holds boxed sources and cannot cross the wire, so remote
/// replies are flattened into this form and rebuilt on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryFailure {
    BufferOverflow { shard_id: ShardId, capacity: usize },
    Unhandled { reason: String },
    ShardHomeUnavailable { shard_id: ShardId, attempts: u32 },
    EntityFailure { entity_id: EntityId, reason: String },
    ShuttingDown,
    Other { reason: String },
}

impl From<&ShardingError> for DeliveryFailure {
    fn from(err: &ShardingError) -> Self {
        match err {
            ShardingError::BufferOverflow { shard_id, capacity } => DeliveryFailure::BufferOverflow {
                shard_id: shard_id.clone(),
                capacity: *capacity,
            },
            ShardingError::Unhandled { reason } => DeliveryFailure::Unhandled {
                reason: reason.clone(),
            },
            ShardingError::ShardHomeUnavailable { shard_id, attempts } => {
                DeliveryFailure::ShardHomeUnavailable {
                    shard_id: shard_id.clone(),
                    attempts: *attempts,
                }
            }
            ShardingError::EntityFailure { entity_id, reason } => DeliveryFailure::EntityFailure {
                entity_id: entity_id.clone(),
                reason: reason.clone(),
            },
            ShardingError::ShuttingDown => DeliveryFailure::ShuttingDown,
            other => DeliveryFailure::Other {
                reason: other.to_string(),
            },
        }
    }
}

impl From<DeliveryFailure> for ShardingError {
    fn from(failure: DeliveryFailure) -> Self {
        match failure {
            DeliveryFailure::BufferOverflow { shard_id, capacity } => {
                ShardingError::BufferOverflow { shard_id, capacity }
            }
            DeliveryFailure::Unhandled { reason } => ShardingError::Unhandled { reason },
            DeliveryFailure::ShardHomeUnavailable { shard_id, attempts } => {
                ShardingError::ShardHomeUnavailable { shard_id, attempts }
            }
            DeliveryFailure::EntityFailure { entity_id, reason } => {
                ShardingError::EntityFailure { entity_id, reason }
            }
            DeliveryFailure::ShuttingDown => ShardingError::ShuttingDown,
            DeliveryFailure::Other { reason } => ShardingError::Unhandled { reason },
        }
    }
}
