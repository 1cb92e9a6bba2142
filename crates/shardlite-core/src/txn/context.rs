//! Per-transaction bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

use crate::error::Result;
use crate::pool::PooledConnection;
use crate::strategy::{ShardId, ShardKey};
use crate::txn::state::{TxnState, Vote};

type Work = dyn Fn(&Connection) -> Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Key(ShardKey),
    Shard(ShardId),
}

/// Unit of work executed on one shard inside the shard's local transaction.
///
/// Operations run in registration order during prepare. They may be re-run
/// from a worker thread, so the closure must be `Send + Sync`.
#[derive(Clone)]
pub struct Operation {
    target: Target,
    label: Option<String>,
    work: Arc<Work>,
}

impl Operation {
    /// Run `work` on whichever shard `key` routes to.
    pub fn new<F>(key: ShardKey, work: F) -> Self
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            target: Target::Key(key),
            label: None,
            work: Arc::new(work),
        }
    }

    /// Run `work` on an explicit shard.
    pub fn on_shard<F>(shard_id: ShardId, work: F) -> Self
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            target: Target::Shard(shard_id),
            label: None,
            work: Arc::new(work),
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("operation")
    }

    pub(crate) fn target(&self) -> Target {
        self.target
    }

    pub(crate) fn run(&self, conn: &Connection) -> Result<()> {
        (self.work)(conn)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("target", &self.target)
            .field("label", &self.label())
            .finish_non_exhaustive()
    }
}

/// State of one cross-shard transaction.
///
/// The shard set is fixed at creation. Connections acquired during prepare
/// are held here until commit or rollback releases them.
pub struct TransactionContext {
    id: String,
    keys: Vec<ShardKey>,
    shard_ids: BTreeSet<ShardId>,
    operations: Vec<(ShardId, Operation)>,
    state: TxnState,
    votes: BTreeMap<ShardId, Vote>,
    held: BTreeMap<ShardId, PooledConnection>,
    failure_reason: Option<String>,
    started: Instant,
    created_at_ms: u64,
    completed_at_ms: Option<u64>,
    elapsed: Option<Duration>,
}

impl TransactionContext {
    pub(crate) fn new(id: String, keys: &[ShardKey], shard_ids: BTreeSet<ShardId>) -> Self {
        let mut seen = BTreeSet::new();
        let keys = keys.iter().copied().filter(|k| seen.insert(*k)).collect();
        Self {
            id,
            keys,
            shard_ids,
            operations: Vec::new(),
            state: TxnState::Initial,
            votes: BTreeMap::new(),
            held: BTreeMap::new(),
            failure_reason: None,
            started: Instant::now(),
            created_at_ms: current_time_ms(),
            completed_at_ms: None,
            elapsed: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Application keys in first-seen order, without duplicates.
    pub fn keys(&self) -> &[ShardKey] {
        &self.keys
    }

    pub fn shard_ids(&self) -> &BTreeSet<ShardId> {
        &self.shard_ids
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn votes(&self) -> &BTreeMap<ShardId, Vote> {
        &self.votes
    }

    /// Shards that voted no, in id order.
    pub fn rejected_shards(&self) -> Vec<ShardId> {
        self.votes
            .values()
            .filter(|v| !v.ready)
            .map(|v| v.shard_id)
            .collect()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Shards whose connection is currently checked out by this transaction.
    pub fn held_shards(&self) -> Vec<ShardId> {
        self.held.keys().copied().collect()
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn completed_at_ms(&self) -> Option<u64> {
        self.completed_at_ms
    }

    /// Time since creation, frozen once the transaction completes.
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.started.elapsed())
    }

    /// True once the transaction reached its final outcome and released
    /// every shard.
    pub fn is_finalized(&self) -> bool {
        self.completed_at_ms.is_some()
    }

    pub(crate) fn shard_list(&self) -> Vec<ShardId> {
        self.shard_ids.iter().copied().collect()
    }

    pub(crate) fn push_operation(&mut self, shard_id: ShardId, op: Operation) {
        self.operations.push((shard_id, op));
    }

    /// Operations for one shard, in registration order.
    pub(crate) fn operations_for(&self, shard_id: ShardId) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|(s, _)| *s == shard_id)
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub(crate) fn transition(&mut self, next: TxnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    pub(crate) fn record_vote(&mut self, vote: Vote) {
        self.votes.insert(vote.shard_id, vote);
    }

    pub(crate) fn set_failure(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
    }

    pub(crate) fn hold(&mut self, shard_id: ShardId, conn: PooledConnection) {
        self.held.insert(shard_id, conn);
    }

    pub(crate) fn take_held(&mut self) -> BTreeMap<ShardId, PooledConnection> {
        std::mem::take(&mut self.held)
    }

    /// Move to a terminal state and stamp completion.
    pub(crate) fn finish(&mut self, state: TxnState) {
        self.transition(state);
        self.completed_at_ms = Some(current_time_ms());
        self.elapsed = Some(self.started.elapsed());
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("shard_ids", &self.shard_ids)
            .field("operations", &self.operations.len())
            .field("held", &self.held_shards())
            .field("failure_reason", &self.failure_reason)
            .finish()
    }
}

pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Connection) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_keys_deduplicated_in_order() {
        let ctx = TransactionContext::new("t".into(), &[5, 1, 5, 3, 1], [1, 3].into());
        assert_eq!(ctx.keys(), &[5, 1, 3]);
        assert_eq!(ctx.state(), TxnState::Initial);
        assert!(!ctx.is_finalized());
    }

    #[test]
    fn test_operations_grouped_by_shard() {
        let mut ctx = TransactionContext::new("t".into(), &[0, 1], [0, 1].into());
        ctx.push_operation(1, Operation::new(1, noop).labeled("a"));
        ctx.push_operation(0, Operation::new(0, noop).labeled("b"));
        ctx.push_operation(1, Operation::on_shard(1, noop).labeled("c"));

        let labels: Vec<_> = ctx
            .operations_for(1)
            .iter()
            .map(|op| op.label().to_owned())
            .collect();
        assert_eq!(labels, vec!["a", "c"]);
        assert_eq!(ctx.operation_count(), 3);
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let mut ctx = TransactionContext::new("t".into(), &[0], [0].into());
        ctx.transition(TxnState::RollingBack);
        ctx.finish(TxnState::RolledBack);
        let frozen = ctx.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ctx.elapsed(), frozen);
        assert!(ctx.is_finalized());
    }
}
