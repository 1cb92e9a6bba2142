//! shardlite: horizontal sharding over local SQLite files.
//!
//! Provides deterministic key-to-shard routing, bounded per-shard connection
//! pools, fan-out queries and atomic cross-shard writes via two-phase commit.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ShardManager                                │
//! │   ├─ ShardingStrategy (hash/range/consistent)│
//! │   ├─ Router ── fan-out + merge               │
//! │   └─ TransactionCoordinator (2PC)            │
//! │        └─ TransactionLogger hooks            │
//! ├──────────────────────────────────────────────┤
//! │  ConnectionPool per shard                    │
//! ├──────────────────────────────────────────────┤
//! │  shard_0.db  shard_1.db  …  (SQLite, WAL)    │
//! └──────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod router;
pub mod sql;
pub mod strategy;
pub mod txn;

pub use crate::config::ShardliteConfig;
pub use crate::error::{Result, ShardError};
pub use crate::manager::{ShardInfo, ShardManager, ShardStats};
pub use crate::pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use crate::router::{FanOut, Router};
pub use crate::sql::Row;
pub use crate::strategy::{
    ConsistentHashStrategy, HashStrategy, RangeStrategy, ShardId, ShardKey, ShardingStrategy,
};
pub use crate::txn::{
    ConsoleLogger, CoordinatorConfig, MetricsLogger, NoopLogger, Operation, TracingLogger,
    Transaction, TransactionContext, TransactionCoordinator, TransactionLogger, TxnState,
};
