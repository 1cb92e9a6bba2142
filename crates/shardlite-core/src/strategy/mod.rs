//! Sharding strategies: deterministic key-to-shard mapping.
//!
//! Every strategy is a pure function of its constructor-time configuration.
//! Identical keys always map to identical shard ids, and the set returned by
//! [`ShardingStrategy::all_shard_ids`] never changes for the lifetime of the
//! instance.

mod consistent;
mod hash;
mod range;

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Result, ShardError};

pub use consistent::ConsistentHashStrategy;
pub use hash::HashStrategy;
pub use range::RangeStrategy;

/// Stable integer identifier of a shard.
pub type ShardId = u32;

/// Application key used for routing.
pub type ShardKey = i64;

/// Maps application keys onto a fixed set of shards.
pub trait ShardingStrategy: Send + Sync + fmt::Debug {
    /// Shard owning `key`. Fails with [`ShardError::InvalidKey`] outside the
    /// strategy's key domain.
    fn shard_id(&self, key: ShardKey) -> Result<ShardId>;

    /// Total number of shards.
    fn shard_count(&self) -> u32;

    /// Every shard id, ascending.
    fn all_shard_ids(&self) -> Vec<ShardId> {
        (0..self.shard_count()).collect()
    }

    /// Shards that may hold any key in the inclusive range `[start, end]`, ascending.
    fn shards_for_range(&self, start: ShardKey, end: ShardKey) -> Result<Vec<ShardId>>;

    fn validate_key(&self, key: ShardKey) -> bool {
        self.shard_id(key).is_ok()
    }

    fn validate_range(&self, start: ShardKey, end: ShardKey) -> bool {
        start <= end && self.validate_key(start) && self.validate_key(end)
    }

    /// How keys `0..sample` spread across shards, indexed by shard id.
    /// Keys outside the domain are skipped.
    fn distribution(&self, sample: u64) -> Vec<u64> {
        let mut counts = vec![0u64; self.shard_count() as usize];
        for key in 0..sample.min(i64::MAX as u64) {
            if let Ok(shard) = self.shard_id(key as ShardKey) {
                counts[shard as usize] += 1;
            }
        }
        counts
    }

    /// Short name used in stats output.
    fn name(&self) -> &'static str;
}

/// Resolve a key list to its deduplicated shard set.
pub fn resolve_shards(
    strategy: &dyn ShardingStrategy,
    keys: &[ShardKey],
) -> Result<BTreeSet<ShardId>> {
    keys.iter().map(|&key| strategy.shard_id(key)).collect()
}

pub(crate) fn check_range(start: ShardKey, end: ShardKey) -> Result<()> {
    if start > end {
        return Err(ShardError::InvalidRange { start, end });
    }
    Ok(())
}

/// Narrow a small range by probing every key in it.
///
/// Returns `None` when the range spans at least `limit` keys.
pub(crate) fn probe_range(
    strategy: &dyn ShardingStrategy,
    start: ShardKey,
    end: ShardKey,
    limit: u32,
) -> Result<Option<Vec<ShardId>>> {
    let span = end as i128 - start as i128;
    if span >= limit as i128 {
        return Ok(None);
    }
    let mut shards = BTreeSet::new();
    for key in start..=end {
        shards.insert(strategy.shard_id(key)?);
    }
    Ok(Some(shards.into_iter().collect()))
}
