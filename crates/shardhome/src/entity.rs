use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ShardingError;
use crate::shard::ShardCommand;
use crate::types::{EntityAddress, RegionAddress, TypeName};

/// Context provided to entity instances when they are spawned.
#[derive(Clone)]
pub struct EntityContext {
    /// The address of this entity instance.
    pub address: EntityAddress,
    /// The region hosting this entity.
    pub region: RegionAddress,
    /// Cancelled when the instance is being force-terminated.
    pub cancellation: CancellationToken,
    shard: mpsc::UnboundedSender<ShardCommand>,
}

impl EntityContext {
    pub(crate) fn new(
        address: EntityAddress,
        region: RegionAddress,
        cancellation: CancellationToken,
        shard: mpsc::UnboundedSender<ShardCommand>,
    ) -> Self {
        Self {
            address,
            region,
            cancellation,
            shard,
        }
    }

    /// Ask the owning shard to stop this instance once its mailbox drains.
    /// Messages arriving meanwhile are buffered and restart the entity.
    pub fn passivate(&self) {
        let _ = self.shard.send(ShardCommand::Passivate(self.address.entity_id.clone()));
    }
}

/// Defines a sharded entity type.
///
/// Each entity type has a unique name and a factory method (`spawn`) that
/// creates one handler per active entity id.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    /// Unique type name for this entity (e.g., "User", "Order").
    fn type_name(&self) -> TypeName;

    /// Create a handler instance for the given entity address.
    /// The returned handler lives until the entity is stopped or handed off.
    async fn spawn(&self, ctx: EntityContext) -> Result<Box<dyn EntityHandler>, ShardingError>;
}

/// Handles messages for one entity instance, one at a time.
#[async_trait]
pub trait EntityHandler: Send {
    /// Handle an incoming request. Returns serialized response bytes.
    async fn handle_request(
        &mut self,
        tag: &str,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>, ShardingError>;

    /// Called before the instance stops for passivation or handoff.
    async fn on_stop(&mut self) {}
}
