//! Consistent-hash ring strategy.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::error::{Result, ShardError};

use super::{check_range, probe_range, ShardId, ShardKey, ShardingStrategy};

/// Ranges up to this many keys are resolved exactly by probing.
const PROBE_LIMIT: u32 = 256;

/// Hash ring with `replicas` virtual nodes per shard.
///
/// Membership is fixed at construction.
#[derive(Debug, Clone)]
pub struct ConsistentHashStrategy {
    ring: BTreeMap<u64, ShardId>,
    shard_count: u32,
}

impl ConsistentHashStrategy {
    pub fn new(shard_count: u32, replicas: usize) -> Result<Self> {
        if shard_count == 0 || replicas == 0 {
            return Err(ShardError::Config(
                "consistent hashing needs at least one shard and one replica".into(),
            ));
        }
        let mut ring = BTreeMap::new();
        for shard_id in 0..shard_count {
            for replica in 0..replicas {
                let hash = hash_of(&format!("shard-{shard_id}-{replica}"));
                ring.insert(hash, shard_id);
            }
        }
        Ok(Self { ring, shard_count })
    }
}

impl ShardingStrategy for ConsistentHashStrategy {
    fn shard_id(&self, key: ShardKey) -> Result<ShardId> {
        let hash = hash_of(&key);
        // First ring position >= hash, wrapping to the start.
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &shard)| shard)
            .ok_or_else(|| ShardError::InvalidKey {
                key,
                reason: "hash ring is empty".into(),
            })
    }

    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn shards_for_range(&self, start: ShardKey, end: ShardKey) -> Result<Vec<ShardId>> {
        check_range(start, end)?;
        match probe_range(self, start, end, PROBE_LIMIT)? {
            Some(shards) => Ok(shards),
            None => Ok(self.all_shard_ids()),
        }
    }

    fn name(&self) -> &'static str {
        "consistent-hash"
    }
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
