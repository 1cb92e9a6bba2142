//! Error types for shardlite.

use thiserror::Error;

use crate::strategy::{ShardId, ShardKey};
use crate::txn::state::TxnState;

/// Errors that can occur while routing, pooling or coordinating shards.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Key is outside the domain the strategy accepts.
    #[error("invalid key {key}: {reason}")]
    InvalidKey { key: ShardKey, reason: String },
    /// Range bounds violate the strategy contract.
    #[error("invalid key range [{start}, {end}]")]
    InvalidRange { start: ShardKey, end: ShardKey },
    /// No connection became available within the acquisition timeout.
    #[error("connection pool for shard {shard_id} exhausted after {waited_ms}ms")]
    PoolExhausted { shard_id: ShardId, waited_ms: u64 },
    /// Pool was used after `close_all`.
    #[error("connection pool for shard {shard_id} is closed")]
    PoolClosed { shard_id: ShardId },
    /// Connection or engine error reaching a shard.
    #[error("shard {shard_id} unavailable: {reason}")]
    ShardUnavailable { shard_id: ShardId, reason: String },
    /// Shard id has no configured pool.
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),
    /// One or more shards voted no during prepare.
    #[error("transaction {txn_id} failed to prepare on shards {shards:?}: {reason}")]
    PrepareFailure {
        txn_id: String,
        shards: Vec<ShardId>,
        reason: String,
    },
    /// A shard that voted yes failed to finalize. Requires manual reconciliation.
    #[error(
        "transaction {txn_id} partially committed: committed on {committed:?}, failed on {failed:?}"
    )]
    PartialCommitFailure {
        txn_id: String,
        committed: Vec<ShardId>,
        failed: Vec<ShardId>,
    },
    /// Operation attempted from a state that forbids it.
    #[error("transaction {txn_id} cannot {action} from state {state}")]
    InvalidState {
        txn_id: String,
        state: TxnState,
        action: &'static str,
    },
    /// A transaction was opened without any keys.
    #[error("transaction requires at least one key")]
    EmptyTransaction,
    /// A transaction logger hook failed. Never escapes the coordinator.
    #[error("transaction logger failure: {0}")]
    LoggerFailure(String),
    /// A registered operation failed.
    #[error("operation failed: {0}")]
    Operation(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid sql identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("serde yaml error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
}

impl ShardError {
    /// Programming-contract violations are surfaced to the caller immediately
    /// instead of being converted into votes.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey { .. }
                | Self::InvalidRange { .. }
                | Self::InvalidState { .. }
                | Self::PoolClosed { .. }
                | Self::EmptyTransaction
                | Self::UnknownShard(_)
        )
    }

    /// Short stable name of the variant, used for metrics bucketing.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "InvalidKey",
            Self::InvalidRange { .. } => "InvalidRange",
            Self::PoolExhausted { .. } => "PoolExhausted",
            Self::PoolClosed { .. } => "PoolClosed",
            Self::ShardUnavailable { .. } => "ShardUnavailable",
            Self::UnknownShard(_) => "UnknownShard",
            Self::PrepareFailure { .. } => "PrepareFailure",
            Self::PartialCommitFailure { .. } => "PartialCommitFailure",
            Self::InvalidState { .. } => "InvalidState",
            Self::EmptyTransaction => "EmptyTransaction",
            Self::LoggerFailure(_) => "LoggerFailure",
            Self::Operation(_) => "Operation",
            Self::Config(_) => "Config",
            Self::InvalidIdentifier(_) => "InvalidIdentifier",
            Self::Sqlite(_) => "Sqlite",
            Self::Io(_) => "Io",
            Self::SerdeJson(_) => "SerdeJson",
            Self::SerdeYaml(_) => "SerdeYaml",
        }
    }

    /// Wrap a pool-level failure as a shard availability error for voting.
    pub(crate) fn into_unavailable(self, shard_id: ShardId) -> Self {
        match self {
            Self::PoolExhausted { .. } | Self::Sqlite(_) | Self::Io(_) => Self::ShardUnavailable {
                shard_id,
                reason: self.to_string(),
            },
            other => other,
        }
    }
}

/// Result alias for shardlite operations.
pub type Result<T> = std::result::Result<T, ShardError>;
