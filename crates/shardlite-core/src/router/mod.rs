//! Key-based routing of SQL work to shard connections.
//!
//! A keyed call runs on the one shard owning the key. A key-less call fans
//! out to every shard in parallel; per-shard failures are collected next to
//! the successful results rather than aborting the whole operation.

pub mod merge;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Result, ShardError};
use crate::pool::ConnectionPool;
use crate::sql::{self, Row};
use crate::strategy::{ShardId, ShardKey, ShardingStrategy};

use merge::{Aggregate, Partial};

/// Results of running one closure on many shards, in shard id order.
#[derive(Debug)]
pub struct FanOut<T> {
    pub results: Vec<(ShardId, T)>,
    pub failures: Vec<(ShardId, ShardError)>,
}

impl<T> FanOut<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.results.iter().map(|(_, v)| v)
    }

    /// All results, or the first shard failure.
    pub fn into_result(self) -> Result<Vec<(ShardId, T)>> {
        match self.failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.results),
        }
    }
}

pub struct Router {
    strategy: Arc<dyn ShardingStrategy>,
    pools: BTreeMap<ShardId, Arc<ConnectionPool>>,
    workers: ThreadPool,
}

impl Router {
    /// `pools` must cover every shard of `strategy`.
    pub fn new(
        strategy: Arc<dyn ShardingStrategy>,
        pools: BTreeMap<ShardId, Arc<ConnectionPool>>,
        max_workers: usize,
    ) -> Result<Self> {
        for shard_id in strategy.all_shard_ids() {
            if !pools.contains_key(&shard_id) {
                return Err(ShardError::UnknownShard(shard_id));
            }
        }
        let workers = ThreadPoolBuilder::new()
            .num_threads(max_workers.max(1))
            .thread_name(|i| format!("shardlite-router-{i}"))
            .build()
            .map_err(|e| ShardError::Config(format!("cannot start router workers: {e}")))?;
        Ok(Self {
            strategy,
            pools,
            workers,
        })
    }

    pub fn strategy(&self) -> &Arc<dyn ShardingStrategy> {
        &self.strategy
    }

    pub fn pools(&self) -> &BTreeMap<ShardId, Arc<ConnectionPool>> {
        &self.pools
    }

    pub fn pool(&self, shard_id: ShardId) -> Result<&Arc<ConnectionPool>> {
        self.pools
            .get(&shard_id)
            .ok_or(ShardError::UnknownShard(shard_id))
    }

    pub fn shard_for(&self, key: ShardKey) -> Result<ShardId> {
        self.strategy.shard_id(key)
    }

    pub fn pool_for_key(&self, key: ShardKey) -> Result<&Arc<ConnectionPool>> {
        self.pool(self.shard_for(key)?)
    }

    /// Run `f` on a connection to one shard. The connection is released when
    /// `f` returns.
    pub fn on_shard<T>(
        &self,
        shard_id: ShardId,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.pool(shard_id)?.acquire()?;
        f(&conn)
    }

    /// Run `f` on the shard owning `key`.
    pub fn with_shard<T>(&self, key: ShardKey, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let shard_id = self.shard_for(key)?;
        debug!(key, shard_id, "routing to shard");
        self.on_shard(shard_id, f)
    }

    /// Run `f` on every shard in parallel.
    pub fn fan_out<T, F>(&self, f: F) -> FanOut<T>
    where
        F: Fn(ShardId, &Connection) -> Result<T> + Sync,
        T: Send,
    {
        let ids = self.strategy.all_shard_ids();
        let outcomes: Vec<(ShardId, Result<T>)> = self.workers.install(|| {
            ids.par_iter()
                .map(|&shard_id| (shard_id, self.on_shard(shard_id, |conn| f(shard_id, conn))))
                .collect()
        });

        let mut fan = FanOut {
            results: Vec::with_capacity(outcomes.len()),
            failures: Vec::new(),
        };
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(value) => fan.results.push((shard_id, value)),
                Err(e) => {
                    warn!(shard_id, error = %e, "fan-out shard failed");
                    fan.failures.push((shard_id, e));
                }
            }
        }
        fan
    }

    fn run<T, F>(&self, key: Option<ShardKey>, f: F) -> Result<FanOut<T>>
    where
        F: Fn(&Connection) -> Result<T> + Sync,
        T: Send,
    {
        match key {
            Some(key) => {
                let shard_id = self.shard_for(key)?;
                let value = self.on_shard(shard_id, &f)?;
                Ok(FanOut {
                    results: vec![(shard_id, value)],
                    failures: Vec::new(),
                })
            }
            None => Ok(self.fan_out(|_, conn| f(conn))),
        }
    }

    pub fn insert(&self, table: &str, row: &Row, key: ShardKey) -> Result<usize> {
        let stmt = sql::insert(table, row)?;
        self.with_shard(key, |conn| stmt.execute(conn))
    }

    /// Rows matching `filter` on the shard owning `key`, or on every shard.
    pub fn select(
        &self,
        table: &str,
        filter: &Row,
        key: Option<ShardKey>,
    ) -> Result<FanOut<Vec<Row>>> {
        let stmt = sql::select(table, filter)?;
        self.run(key, |conn| stmt.query(conn))
    }

    pub fn update(
        &self,
        table: &str,
        set: &Row,
        filter: &Row,
        key: Option<ShardKey>,
    ) -> Result<FanOut<usize>> {
        let stmt = sql::update(table, set, filter)?;
        self.run(key, |conn| stmt.execute(conn))
    }

    pub fn delete(&self, table: &str, filter: &Row, key: Option<ShardKey>) -> Result<FanOut<usize>> {
        let stmt = sql::delete(table, filter)?;
        self.run(key, |conn| stmt.execute(conn))
    }

    /// Per-shard partials of `expr` (e.g. `SUM(amount)`), ready for
    /// [`Aggregate::merge`].
    pub fn aggregate(&self, table: &str, expr: &str) -> Result<(Aggregate, FanOut<Partial>)> {
        let table = sql::validate_identifier(table)?;
        let aggregate = Aggregate::parse(expr)?;
        let fan = self.fan_out(|_, conn| aggregate.partial(conn, table));
        Ok((aggregate, fan))
    }

    /// Execute a schema script on every shard.
    pub fn apply_schema(&self, ddl: &str) -> FanOut<()> {
        self.fan_out(|_, conn| Ok(conn.execute_batch(ddl)?))
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("strategy", &self.strategy.name())
            .field("shards", &self.pools.keys().collect::<Vec<_>>())
            .field("workers", &self.workers.current_num_threads())
            .finish()
    }
}
