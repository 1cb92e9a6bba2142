use crate::error::{Result, ShardError};

use super::{check_range, probe_range, ShardId, ShardKey, ShardingStrategy};

/// Modulo strategy: `shard = |key| mod shard_count`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashStrategy {
    shard_count: u32,
}

impl HashStrategy {
    pub fn new(shard_count: u32) -> Result<Self> {
        if shard_count == 0 {
            return Err(ShardError::Config(
                "shard count must be a positive integer".into(),
            ));
        }
        Ok(Self { shard_count })
    }
}

impl ShardingStrategy for HashStrategy {
    fn shard_id(&self, key: ShardKey) -> Result<ShardId> {
        // unsigned_abs keeps i64::MIN in the domain
        Ok((key.unsigned_abs() % self.shard_count as u64) as ShardId)
    }

    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn shards_for_range(&self, start: ShardKey, end: ShardKey) -> Result<Vec<ShardId>> {
        check_range(start, end)?;
        match probe_range(self, start, end, self.shard_count)? {
            Some(shards) => Ok(shards),
            None => Ok(self.all_shard_ids()),
        }
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}
