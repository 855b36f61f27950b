use super::{EntityId, ShardId, TypeName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full address of an entity instance: type + shard + id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntityAddress {
    pub type_name: TypeName,
    pub shard_id: ShardId,
    pub entity_id: EntityId,
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.type_name, self.shard_id, self.entity_id)
    }
}
