/// DJB2 hash function for stable shard derivation.
/// Produces a deterministic hash for any byte slice.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Compute the shard index for an entity id.
///
/// Returns a 0-indexed shard in `[0, number_of_shards)`. A shard count of 0 is
/// treated as 1; `ShardingConfig::validate` rejects it before it gets here.
pub fn shard_for_entity(entity_id: &str, number_of_shards: u32) -> u32 {
    djb2_hash(entity_id.as_bytes()) % number_of_shards.max(1)
}
