//! Lifecycle hooks for observing transactions.
//!
//! The coordinator calls each hook synchronously on the thread driving the
//! transaction. Hook failures, including panics, are caught and counted by
//! the coordinator and never change a transaction's outcome.

use std::io::{self, Write};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, ShardError};
use crate::strategy::ShardId;
use crate::txn::context::current_time_ms;
use crate::txn::state::TxnState;

/// Observer of transaction lifecycle events. Every hook defaults to a no-op,
/// so adapters implement only what they need.
pub trait TransactionLogger: Send + Sync {
    /// Prepare phase is starting on `shards`.
    fn on_prepare(&self, _txn_id: &str, _shards: &[ShardId]) -> Result<()> {
        Ok(())
    }

    /// A shard voted.
    fn on_vote(&self, _txn_id: &str, _shard_id: ShardId, _ready: bool) -> Result<()> {
        Ok(())
    }

    /// Commit phase is starting on `shards`.
    fn on_commit(&self, _txn_id: &str, _shards: &[ShardId]) -> Result<()> {
        Ok(())
    }

    fn on_rollback(&self, _txn_id: &str, _shards: &[ShardId], _reason: &str) -> Result<()> {
        Ok(())
    }

    /// The transaction reached its final state.
    fn on_complete(&self, _txn_id: &str, _state: TxnState, _elapsed: Duration) -> Result<()> {
        Ok(())
    }

    /// An error occurred, on a specific shard when `shard_id` is set.
    fn on_error(&self, _txn_id: &str, _error: &ShardError, _shard_id: Option<ShardId>) -> Result<()> {
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl TransactionLogger for NoopLogger {}

/// Writes one human-readable line per event.
///
/// ```text
/// [1718000000.123] TX 3fa1c2d4e5b60718-00000001: prepare started on shards [0, 3]
/// ```
pub struct ConsoleLogger {
    out: Mutex<Box<dyn Write + Send>>,
    verbose: bool,
}

impl ConsoleLogger {
    /// Log to stdout. With `verbose`, individual votes and error kinds are
    /// included.
    pub fn new(verbose: bool) -> Self {
        Self::with_writer(io::stdout(), verbose)
    }

    pub fn with_writer(writer: impl Write + Send + 'static, verbose: bool) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
            verbose,
        }
    }

    fn line(&self, txn_id: &str, message: std::fmt::Arguments<'_>) -> Result<()> {
        let now = current_time_ms();
        let mut out = self.out.lock();
        writeln!(out, "[{}.{:03}] TX {txn_id}: {message}", now / 1000, now % 1000)?;
        out.flush()?;
        Ok(())
    }
}

impl TransactionLogger for ConsoleLogger {
    fn on_prepare(&self, txn_id: &str, shards: &[ShardId]) -> Result<()> {
        self.line(txn_id, format_args!("prepare started on shards {shards:?}"))
    }

    fn on_vote(&self, txn_id: &str, shard_id: ShardId, ready: bool) -> Result<()> {
        if !self.verbose {
            return Ok(());
        }
        let vote = if ready { "yes" } else { "no" };
        self.line(txn_id, format_args!("shard {shard_id} voted {vote}"))
    }

    fn on_commit(&self, txn_id: &str, shards: &[ShardId]) -> Result<()> {
        self.line(txn_id, format_args!("commit started on shards {shards:?}"))
    }

    fn on_rollback(&self, txn_id: &str, shards: &[ShardId], reason: &str) -> Result<()> {
        self.line(
            txn_id,
            format_args!("rollback on shards {shards:?}: {reason}"),
        )
    }

    fn on_complete(&self, txn_id: &str, state: TxnState, elapsed: Duration) -> Result<()> {
        self.line(
            txn_id,
            format_args!("completed as {state} in {:.3}ms", elapsed.as_secs_f64() * 1000.0),
        )
    }

    fn on_error(&self, txn_id: &str, error: &ShardError, shard_id: Option<ShardId>) -> Result<()> {
        match (self.verbose, shard_id) {
            (true, Some(shard)) => self.line(
                txn_id,
                format_args!("error on shard {shard} ({}): {error}", error.kind()),
            ),
            (true, None) => self.line(txn_id, format_args!("error ({}): {error}", error.kind())),
            (false, Some(shard)) => self.line(txn_id, format_args!("error on shard {shard}: {error}")),
            (false, None) => self.line(txn_id, format_args!("error: {error}")),
        }
    }
}

/// Forwards events to `tracing` under the `shardlite::txn` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl TransactionLogger for TracingLogger {
    fn on_prepare(&self, txn_id: &str, shards: &[ShardId]) -> Result<()> {
        tracing::info!(target: "shardlite::txn", txn_id, ?shards, "prepare");
        Ok(())
    }

    fn on_vote(&self, txn_id: &str, shard_id: ShardId, ready: bool) -> Result<()> {
        tracing::debug!(target: "shardlite::txn", txn_id, shard_id, ready, "vote");
        Ok(())
    }

    fn on_commit(&self, txn_id: &str, shards: &[ShardId]) -> Result<()> {
        tracing::info!(target: "shardlite::txn", txn_id, ?shards, "commit");
        Ok(())
    }

    fn on_rollback(&self, txn_id: &str, shards: &[ShardId], reason: &str) -> Result<()> {
        tracing::warn!(target: "shardlite::txn", txn_id, ?shards, reason, "rollback");
        Ok(())
    }

    fn on_complete(&self, txn_id: &str, state: TxnState, elapsed: Duration) -> Result<()> {
        tracing::info!(
            target: "shardlite::txn",
            txn_id,
            state = %state,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "complete"
        );
        Ok(())
    }

    fn on_error(&self, txn_id: &str, error: &ShardError, shard_id: Option<ShardId>) -> Result<()> {
        tracing::error!(target: "shardlite::txn", txn_id, ?shard_id, %error, "error");
        Ok(())
    }
}
