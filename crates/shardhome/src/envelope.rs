use crate::error::ShardingError;
use crate::types::{EntityId, RegionAddress, ShardId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// An application message addressed to a sharded entity.
///
/// The entity id is optional so that extraction failures can be reported as
/// unhandled instead of being routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub entity_id: Option<EntityId>,
    /// Operation name, passed through to the entity handler.
    pub tag: String,
    /// MessagePack-encoded body.
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl Envelope {
    pub fn new(entity_id: impl Into<String>, tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            entity_id: Some(EntityId::new(entity_id)),
            tag: tag.into(),
            payload,
            headers: HashMap::new(),
        }
    }

    /// Build an envelope with a MessagePack-encoded body.
    pub fn encode<T: Serialize>(
        entity_id: impl Into<String>,
        tag: impl Into<String>,
        body: &T,
    ) -> Result<Self, ShardingError> {
        Ok(Self::new(entity_id, tag, rmp_serde::to_vec(body)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Decode the body as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ShardingError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// An envelope after extraction, as it travels between regions and shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEnvelope {
    pub shard_id: ShardId,
    pub entity_id: EntityId,
    pub envelope: Envelope,
}

/// Correlates a remote ask with its reply. Sequence numbers are unique per
/// origin region.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestId {
    pub origin: RegionAddress,
    pub seq: u64,
}

/// Where the outcome of a delivery goes.
///
/// A `Tell` is acknowledged once the envelope has been handed to an entity
/// mailbox, on this node or on the remote region it was forwarded to; an
/// `Ask` completes with the entity's reply.
#[derive(Debug)]
pub(crate) enum Originator {
    Tell(Option<oneshot::Sender<Result<(), ShardingError>>>),
    Ask(oneshot::Sender<Result<Vec<u8>, ShardingError>>),
}

impl Originator {
    pub(crate) fn none() -> Self {
        Originator::Tell(None)
    }

    pub(crate) fn fail(self, err: ShardingError) {
        match self {
            Originator::Tell(Some(tx)) => {
                let _ = tx.send(Err(err));
            }
            Originator::Tell(None) => {
                tracing::warn!(error = %err, "delivery failed with nobody waiting for the outcome");
            }
            Originator::Ask(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Mark a tell as accepted. Returns the originator back when it is an
    /// ask, since an ask only completes with the entity's reply.
    pub(crate) fn accepted(self) -> Option<Self> {
        match self {
            Originator::Tell(Some(tx)) => {
                let _ = tx.send(Ok(()));
                None
            }
            Originator::Tell(None) => None,
            ask @ Originator::Ask(_) => Some(ask),
        }
    }

    /// The sender stopped waiting, e.g. after its own timeout.
    pub(crate) fn is_closed(&self) -> bool {
        match self {
            Originator::Tell(Some(tx)) => tx.is_closed(),
            Originator::Tell(None) => false,
            Originator::Ask(tx) => tx.is_closed(),
        }
    }

    pub(crate) fn reply(self, result: Result<Vec<u8>, ShardingError>) {
        match self {
            Originator::Ask(tx) => {
                let _ = tx.send(result);
            }
            Originator::Tell(Some(tx)) => {
                let _ = tx.send(result.map(|_| ()));
            }
            Originator::Tell(None) => {}
        }
    }
}
