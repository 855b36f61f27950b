use crate::envelope::Envelope;
use crate::hash::shard_for_entity;
use crate::types::{EntityId, ShardId};

/// Derives entity and shard ids from an application message.
///
/// Both functions must be deterministic for a given message. Envelopes for
/// which `entity_id` returns `None` are reported to the sender as unhandled.
pub trait MessageExtractor: Send + Sync + 'static {
    fn entity_id(&self, envelope: &Envelope) -> Option<EntityId>;

    fn shard_id(&self, envelope: &Envelope) -> ShardId;
}

/// Default extractor: entity id from the envelope, shard id from a DJB2 hash
/// of the entity id modulo `number_of_shards`.
#[derive(Debug, Clone)]
pub struct HashMessageExtractor {
    pub number_of_shards: u32,
}

impl HashMessageExtractor {
    pub fn new(number_of_shards: u32) -> Self {
        Self { number_of_shards }
    }
}

impl MessageExtractor for HashMessageExtractor {
    fn entity_id(&self, envelope: &Envelope) -> Option<EntityId> {
        envelope
            .entity_id
            .clone()
            .filter(|id| !id.as_ref().is_empty())
    }

    fn shard_id(&self, envelope: &Envelope) -> ShardId {
        let key = envelope
            .entity_id
            .as_ref()
            .map(|id| id.as_ref())
            .unwrap_or_default();
        ShardId::new(shard_for_entity(key, self.number_of_shards).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_entity_same_shard() {
        let extractor = HashMessageExtractor::new(10);
        let a = Envelope::new("user-1", "a", vec![]);
        let b = Envelope::new("user-1", "b", vec![9]);
        assert_eq!(extractor.shard_id(&a), extractor.shard_id(&b));
    }

    #[test]
    fn empty_entity_id_is_not_extracted() {
        let extractor = HashMessageExtractor::new(10);
        let env = Envelope::new("", "a", vec![]);
        assert!(extractor.entity_id(&env).is_none());

        let mut env = Envelope::new("x", "a", vec![]);
        env.entity_id = None;
        assert!(extractor.entity_id(&env).is_none());
    }

    #[test]
    fn shard_ids_stay_in_range() {
        let extractor = HashMessageExtractor::new(5);
        for i in 0..200 {
            let shard = extractor.shard_id(&Envelope::new(format!("e-{i}"), "t", vec![]));
            let n: u32 = shard.as_ref().parse().unwrap();
            assert!(n < 5);
        }
    }
}
