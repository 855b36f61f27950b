//! Shard placement and coordination for clustered entities.
//!
//! Entities are grouped into shards. One [`ShardCoordinator`] per entity type,
//! running on the cluster leader, decides which node's region hosts each
//! shard and moves shards between regions with a handoff protocol. Each
//! node runs a [`ShardRegion`] per type that resolves shard homes, buffers
//! messages while a home is unknown, and hosts the shards allocated to it.
//!
//! Start a type on a node through [`ClusterSharding`]:
//!
//! ```ignore
//! let sharding = ClusterSharding::new(node, transport, membership, metrics);
//! let region = sharding
//!     .start(
//!         ShardedType::new(CartEntity)
//!             .with_state_store(StateStoreMode::KeyValue(kv))
//!             .with_remember_entities(RememberEntitiesMode::KeyValue(kv)),
//!     )
//!     .await?;
//! let reply = region.ask(Envelope::encode("cart-1", "add", &item)?).await?;
//! ```
//!
//! [`ShardCoordinator`]: coordinator
//! [`ShardRegion`]: region

pub mod allocation;
mod buffer;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod extractor;
pub mod hash;
pub mod lease;
pub mod membership;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod region;
pub mod remember;
mod shard;
pub mod sharding;
mod singleton;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod types;

pub use config::ShardingConfig;
pub use coordinator::StateStoreMode;
pub use entity::{Entity, EntityContext, EntityHandler};
pub use envelope::Envelope;
pub use error::ShardingError;
pub use region::RegionHandle;
pub use remember::RememberEntitiesMode;
pub use sharding::{ClusterSharding, ProxyType, ShardedType};
