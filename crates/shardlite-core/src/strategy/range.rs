use crate::error::{Result, ShardError};

use super::{check_range, ShardId, ShardKey, ShardingStrategy};

/// Contiguous key ranges.
///
/// With split points `s0 < s1 < ... < s(n-2)` over `[min_key, max_key]`,
/// shard 0 owns `[min_key, s0)`, shard `i` owns `[s(i-1), s(i))` and the
/// last shard owns `[s(n-2), max_key]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeStrategy {
    min_key: ShardKey,
    max_key: ShardKey,
    splits: Vec<ShardKey>,
}

impl RangeStrategy {
    pub fn new(min_key: ShardKey, splits: Vec<ShardKey>, max_key: ShardKey) -> Result<Self> {
        if min_key > max_key {
            return Err(ShardError::Config(format!(
                "range strategy min_key {min_key} exceeds max_key {max_key}"
            )));
        }
        let mut prev = min_key;
        for &split in &splits {
            if split <= prev || split > max_key {
                return Err(ShardError::Config(format!(
                    "split point {split} must be strictly increasing within ({min_key}, {max_key}]"
                )));
            }
            prev = split;
        }
        Ok(Self {
            min_key,
            max_key,
            splits,
        })
    }

    /// Split `[min_key, max_key]` into `shard_count` equally sized ranges.
    pub fn uniform(min_key: ShardKey, max_key: ShardKey, shard_count: u32) -> Result<Self> {
        if shard_count == 0 {
            return Err(ShardError::Config(
                "shard count must be a positive integer".into(),
            ));
        }
        let span = max_key as i128 - min_key as i128 + 1;
        if span < shard_count as i128 {
            return Err(ShardError::Config(format!(
                "cannot split {span} keys into {shard_count} shards"
            )));
        }
        let width = span / shard_count as i128;
        let splits = (1..shard_count as i128)
            .map(|i| (min_key as i128 + i * width) as ShardKey)
            .collect();
        Self::new(min_key, splits, max_key)
    }

    pub fn bounds(&self) -> (ShardKey, ShardKey) {
        (self.min_key, self.max_key)
    }
}

impl ShardingStrategy for RangeStrategy {
    fn shard_id(&self, key: ShardKey) -> Result<ShardId> {
        if key < self.min_key || key > self.max_key {
            return Err(ShardError::InvalidKey {
                key,
                reason: format!("outside [{}, {}]", self.min_key, self.max_key),
            });
        }
        // number of split points <= key
        Ok(self.splits.partition_point(|&split| split <= key) as ShardId)
    }

    fn shard_count(&self) -> u32 {
        self.splits.len() as u32 + 1
    }

    fn shards_for_range(&self, start: ShardKey, end: ShardKey) -> Result<Vec<ShardId>> {
        check_range(start, end)?;
        let first = self.shard_id(start)?;
        let last = self.shard_id(end)?;
        Ok((first..=last).collect())
    }

    fn name(&self) -> &'static str {
        "range"
    }
}
