//! One-stop entry point for a directory of shards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ShardliteConfig;
use crate::error::{Result, ShardError};
use crate::pool::{ConnectionPool, PoolStats};
use crate::router::{merge, FanOut, Router};
use crate::sql::Row;
use crate::strategy::{HashStrategy, ShardId, ShardKey, ShardingStrategy};
use crate::txn::{
    NoopLogger, Operation, Transaction, TransactionCoordinator, TransactionLogger,
};

/// Sample size used for [`ShardStats::distribution`].
const DISTRIBUTION_SAMPLE: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardStats {
    pub strategy: &'static str,
    pub db_dir: PathBuf,
    pub total_shards: u32,
    pub existing_shards: u32,
    pub total_size_bytes: u64,
    pub avg_size_bytes: f64,
    /// How keys `0..1000` spread across shards.
    pub distribution: Vec<u64>,
    pub shards: Vec<ShardInfo>,
}

/// Opens every shard of a [`ShardliteConfig`] and wires the router and the
/// transaction coordinator over the same pools.
pub struct ShardManager {
    config: ShardliteConfig,
    router: Router,
    coordinator: TransactionCoordinator,
    shut_down: AtomicBool,
}

impl ShardManager {
    /// Hash routing, no transaction logging.
    pub fn open(config: ShardliteConfig) -> Result<Self> {
        Self::open_with(config, None, None)
    }

    pub fn open_with(
        config: ShardliteConfig,
        strategy: Option<Arc<dyn ShardingStrategy>>,
        logger: Option<Arc<dyn TransactionLogger>>,
    ) -> Result<Self> {
        config.validate()?;
        let strategy: Arc<dyn ShardingStrategy> = match strategy {
            Some(s) => s,
            None => Arc::new(HashStrategy::new(config.num_shards)?),
        };
        if strategy.shard_count() != config.num_shards {
            return Err(ShardError::Config(format!(
                "strategy {} covers {} shards but num_shards is {}",
                strategy.name(),
                strategy.shard_count(),
                config.num_shards
            )));
        }

        if !config.db_dir.exists() {
            if !config.auto_create_dirs {
                return Err(ShardError::Config(format!(
                    "database directory {} does not exist",
                    config.db_dir.display()
                )));
            }
            std::fs::create_dir_all(&config.db_dir)?;
        }

        let mut pools = BTreeMap::new();
        for (shard_id, path) in config.all_shard_paths() {
            if !path.exists() {
                let conn = Connection::open(&path)?;
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                debug!(shard_id, path = %path.display(), "created shard file");
            }
            pools.insert(
                shard_id,
                ConnectionPool::new(shard_id, path, config.pool_config())?,
            );
        }

        let router = Router::new(strategy, pools, config.max_workers)?;
        let logger: Arc<dyn TransactionLogger> = match logger {
            Some(logger) => logger,
            None => Arc::new(NoopLogger),
        };
        let coordinator =
            TransactionCoordinator::new(&router, logger, config.coordinator_config())?;
        info!(
            shards = config.num_shards,
            strategy = router.strategy().name(),
            db_dir = %config.db_dir.display(),
            "shard manager opened"
        );
        Ok(Self {
            config,
            router,
            coordinator,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ShardliteConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn strategy(&self) -> &Arc<dyn ShardingStrategy> {
        self.router.strategy()
    }

    pub fn shard_for(&self, key: ShardKey) -> Result<ShardId> {
        self.router.shard_for(key)
    }

    /// Apply `ddl` to every shard. Fails with the first shard error.
    pub fn apply_schema(&self, ddl: &str) -> Result<()> {
        self.router.apply_schema(ddl).into_result()?;
        Ok(())
    }

    pub fn insert(&self, table: &str, row: &Row, key: ShardKey) -> Result<usize> {
        self.router.insert(table, row, key)
    }

    /// Rows from the owning shard, or from every shard when `key` is `None`.
    pub fn select(&self, table: &str, filter: &Row, key: Option<ShardKey>) -> Result<Vec<Row>> {
        let fan = require_complete(self.router.select(table, filter, key)?)?;
        Ok(merge::concat_rows(fan))
    }

    pub fn update(
        &self,
        table: &str,
        set: &Row,
        filter: &Row,
        key: Option<ShardKey>,
    ) -> Result<usize> {
        let fan = require_complete(self.router.update(table, set, filter, key)?)?;
        Ok(merge::total_affected(&fan))
    }

    pub fn delete(&self, table: &str, filter: &Row, key: Option<ShardKey>) -> Result<usize> {
        let fan = require_complete(self.router.delete(table, filter, key)?)?;
        Ok(merge::total_affected(&fan))
    }

    /// Cluster-wide aggregate such as `COUNT(*)` or `AVG(amount)`.
    pub fn aggregate(&self, table: &str, expr: &str) -> Result<Value> {
        let (aggregate, fan) = self.router.aggregate(table, expr)?;
        let partials = fan.into_result()?;
        Ok(aggregate.merge(partials.iter().map(|(_, p)| p)))
    }

    pub fn transaction(&self, keys: &[ShardKey]) -> Result<Transaction<'_>> {
        self.coordinator.transaction(keys)
    }

    pub fn run_transaction(&self, keys: &[ShardKey], operations: Vec<Operation>) -> Result<bool> {
        self.coordinator.run(keys, operations)
    }

    pub fn with_transaction<F>(&self, keys: &[ShardKey], f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        self.coordinator.with_transaction(keys, f)
    }

    pub fn shard_info(&self) -> Vec<ShardInfo> {
        self.config
            .all_shard_paths()
            .into_iter()
            .map(|(shard_id, path)| {
                let meta = std::fs::metadata(&path).ok();
                ShardInfo {
                    shard_id,
                    exists: meta.is_some(),
                    size_bytes: meta.map_or(0, |m| m.len()),
                    path,
                }
            })
            .collect()
    }

    pub fn shard_stats(&self) -> ShardStats {
        let shards = self.shard_info();
        let existing = shards.iter().filter(|s| s.exists).count() as u32;
        let total_size: u64 = shards.iter().map(|s| s.size_bytes).sum();
        ShardStats {
            strategy: self.strategy().name(),
            db_dir: self.config.db_dir.clone(),
            total_shards: self.config.num_shards,
            existing_shards: existing,
            total_size_bytes: total_size,
            avg_size_bytes: if existing == 0 {
                0.0
            } else {
                total_size as f64 / existing as f64
            },
            distribution: self.strategy().distribution(DISTRIBUTION_SAMPLE),
            shards,
        }
    }

    /// True when every shard file exists and opens as a SQLite database.
    pub fn validate_shard_files(&self) -> bool {
        self.router.fan_out(|_, conn| {
            conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |r| r.get::<_, i64>(0))?;
            Ok(())
        })
        .is_complete()
            && self.shard_info().iter().all(|s| s.exists)
    }

    pub fn pool_stats(&self) -> BTreeMap<ShardId, PoolStats> {
        self.router
            .pools()
            .iter()
            .map(|(id, pool)| (*id, pool.stats()))
            .collect()
    }

    /// Close every pool. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in self.router.pools().values() {
            pool.close_all();
        }
        info!(db_dir = %self.config.db_dir.display(), "shard manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

fn require_complete<T>(mut fan: FanOut<T>) -> Result<FanOut<T>> {
    if fan.failures.is_empty() {
        return Ok(fan);
    }
    Err(fan.failures.swap_remove(0).1)
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::row;
    use crate::strategy::RangeStrategy;

    fn manager(dir: &tempfile::TempDir) -> ShardManager {
        let config = ShardliteConfig {
            num_shards: 3,
            ..ShardliteConfig::with_dir(dir.path().join("shards"))
        };
        ShardManager::open(config).unwrap()
    }

    #[test]
    fn test_open_creates_shard_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let info = mgr.shard_info();
        assert_eq!(info.len(), 3);
        assert!(info.iter().all(|s| s.exists));
        assert!(info[1].path.ends_with("shard_1.db"));
        assert!(mgr.validate_shard_files());
    }

    #[test]
    fn test_missing_dir_without_auto_create() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShardliteConfig {
            auto_create_dirs: false,
            ..ShardliteConfig::with_dir(dir.path().join("absent"))
        };
        assert!(matches!(ShardManager::open(config), Err(ShardError::Config(_))));
    }

    #[test]
    fn test_strategy_must_match_shard_count() {
        let dir = tempfile::tempdir().unwrap();
        let strategy: Arc<dyn ShardingStrategy> =
            Arc::new(RangeStrategy::uniform(0, 100, 2).unwrap());
        let result = ShardManager::open_with(ShardliteConfig::with_dir(dir.path()), Some(strategy), None);
        assert!(matches!(result, Err(ShardError::Config(_))));
    }

    #[test]
    fn test_crud_and_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.apply_schema("CREATE TABLE orders (id INTEGER PRIMARY KEY, amount INTEGER)")
            .unwrap();
        for id in 1..=6i64 {
            mgr.insert("orders", &row([("id", id), ("amount", id * 10)]), id)
                .unwrap();
        }
        assert_eq!(mgr.select("orders", &Row::new(), None).unwrap().len(), 6);
        assert_eq!(mgr.select("orders", &row([("id", 4i64)]), Some(4)).unwrap().len(), 1);
        assert_eq!(mgr.aggregate("orders", "SUM(amount)").unwrap(), Value::Integer(210));
        assert_eq!(mgr.aggregate("orders", "COUNT(*)").unwrap(), Value::Integer(6));
        assert_eq!(mgr.aggregate("orders", "MAX(amount)").unwrap(), Value::Integer(60));

        let updated = mgr
            .update("orders", &row([("amount", 0i64)]), &row([("id", 2i64)]), None)
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(mgr.delete("orders", &Row::new(), None).unwrap(), 6);
    }

    #[test]
    fn test_stats_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let stats = mgr.shard_stats();
        assert_eq!(stats.total_shards, 3);
        assert_eq!(stats.existing_shards, 3);
        assert_eq!(stats.distribution.iter().sum::<u64>(), 1000);
        assert_eq!(stats.strategy, "hash");
        assert_eq!(mgr.pool_stats().len(), 3);

        mgr.shutdown();
        mgr.shutdown();
        assert!(mgr.is_shut_down());
        assert!(matches!(
            mgr.insert("orders", &row([("id", 1i64)]), 1),
            Err(ShardError::PoolClosed { .. })
        ));
    }
}
