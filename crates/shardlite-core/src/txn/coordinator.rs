//! Two-phase commit coordinator.
//!
//! Prepare opens a write transaction on every participating shard, runs the
//! registered operations and collects one vote per shard. Commit finalizes
//! every shard only after all of them voted yes. Any no vote, error or
//! timeout during prepare leads to rollback on every shard.
//!
//! Each phase runs its shard tasks on a bounded worker pool of its own.
//! Prepare is bounded by the phase timeout; commit and rollback wait for
//! the real outcome on every shard. Connections acquired during prepare stay
//! checked out in the [`TransactionContext`] until commit or rollback returns
//! them to their pools.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::MAX_TIMEOUT;
use crate::error::{Result, ShardError};
use crate::pool::ConnectionPool;
use crate::router::Router;
use crate::strategy::{self, ShardId, ShardKey, ShardingStrategy};
use crate::txn::context::{Operation, Target, TransactionContext};
use crate::txn::logger::TransactionLogger;
use crate::txn::participant;
use crate::txn::state::{TxnState, Vote};
use crate::txn::workers::{panic_message, PhaseWorkers, TaskOutcome};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Upper bound on worker threads for one phase of one transaction.
    pub max_workers: usize,
    /// Upper bound on the prepare phase. Shards that do not answer in time
    /// vote no.
    pub phase_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            phase_timeout: Duration::from_secs(60),
        }
    }
}

/// Drives cross-shard transactions through two-phase commit.
pub struct TransactionCoordinator {
    strategy: Arc<dyn ShardingStrategy>,
    pools: BTreeMap<ShardId, Arc<ConnectionPool>>,
    logger: Arc<dyn TransactionLogger>,
    workers: PhaseWorkers,
    config: CoordinatorConfig,
    instance: u64,
    logger_failures: AtomicU64,
}

impl TransactionCoordinator {
    /// Coordinate over the router's strategy and pools.
    pub fn new(
        router: &Router,
        logger: Arc<dyn TransactionLogger>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        Self::with_parts(
            Arc::clone(router.strategy()),
            router.pools().clone(),
            logger,
            config,
        )
    }

    pub fn with_parts(
        strategy: Arc<dyn ShardingStrategy>,
        pools: BTreeMap<ShardId, Arc<ConnectionPool>>,
        logger: Arc<dyn TransactionLogger>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        if config.phase_timeout.is_zero() || config.phase_timeout > MAX_TIMEOUT {
            return Err(ShardError::Config(format!(
                "phase timeout must be positive and at most {MAX_TIMEOUT:?}"
            )));
        }
        for shard_id in strategy.all_shard_ids() {
            if !pools.contains_key(&shard_id) {
                return Err(ShardError::UnknownShard(shard_id));
            }
        }
        let workers = PhaseWorkers::new(config.max_workers, "shardlite-2pc")?;
        Ok(Self {
            strategy,
            pools,
            logger,
            workers,
            config,
            instance: fastrand::u64(..),
            logger_failures: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of logger hook invocations that failed or panicked.
    pub fn logger_failures(&self) -> u64 {
        self.logger_failures.load(Ordering::Relaxed)
    }

    /// Start a transaction over the shards owning `keys`. No shard is touched
    /// until [`prepare`](Self::prepare).
    pub fn begin(&self, keys: &[ShardKey]) -> Result<TransactionContext> {
        if keys.is_empty() {
            return Err(ShardError::EmptyTransaction);
        }
        let shard_ids = strategy::resolve_shards(self.strategy.as_ref(), keys)?;
        if let Some(&missing) = shard_ids.iter().find(|id| !self.pools.contains_key(id)) {
            return Err(ShardError::UnknownShard(missing));
        }
        let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let id = format!("{:016x}-{seq:08x}", self.instance);
        debug!(txn_id = %id, ?shard_ids, "transaction started");
        Ok(TransactionContext::new(id, keys, shard_ids))
    }

    /// Register an operation. Only allowed before prepare, and only on a
    /// shard the transaction was opened for.
    pub fn add_operation(&self, ctx: &mut TransactionContext, op: Operation) -> Result<()> {
        Self::require(ctx, TxnState::Initial, "add operation")?;
        let shard_id = match op.target() {
            Target::Key(key) => {
                let shard_id = self.strategy.shard_id(key)?;
                if !ctx.shard_ids().contains(&shard_id) {
                    return Err(ShardError::InvalidKey {
                        key,
                        reason: format!(
                            "routes to shard {shard_id}, outside transaction {}",
                            ctx.id()
                        ),
                    });
                }
                shard_id
            }
            Target::Shard(shard_id) => {
                if !ctx.shard_ids().contains(&shard_id) {
                    return Err(ShardError::UnknownShard(shard_id));
                }
                shard_id
            }
        };
        ctx.push_operation(shard_id, op);
        Ok(())
    }

    /// Phase one. Returns `Ok(true)` when every shard voted yes and the
    /// transaction is `Prepared`, `Ok(false)` when it is `Failed`.
    ///
    /// A closed pool is a contract violation: the transaction is marked
    /// `Failed` and the error is returned after all votes are collected.
    pub fn prepare(&self, ctx: &mut TransactionContext) -> Result<bool> {
        Self::require(ctx, TxnState::Initial, "prepare")?;
        let phase = self.workers.start(ctx.shard_ids().len())?;
        ctx.transition(TxnState::Preparing);
        let txn_id = ctx.id().to_owned();
        let shards = ctx.shard_list();
        self.notify(&txn_id, "on_prepare", |l| l.on_prepare(&txn_id, &shards));

        let mut tasks = Vec::with_capacity(shards.len());
        for &shard_id in &shards {
            let pool = Arc::clone(self.pool(shard_id)?);
            let ops = ctx.operations_for(shard_id);
            tasks.push((shard_id, move || participant::prepare_shard(&pool, &ops)));
        }

        let timeout = self.config.phase_timeout;
        let mut rejected: Vec<String> = Vec::new();
        let mut closed: Option<ShardError> = None;
        phase.run_until(tasks, timeout, |shard_id, outcome| {
            let result = match outcome {
                TaskOutcome::Done(prepared) => {
                    if let Some(conn) = prepared.conn {
                        ctx.hold(shard_id, conn);
                    }
                    prepared.result
                }
                TaskOutcome::Panicked(msg) => Err(ShardError::ShardUnavailable {
                    shard_id,
                    reason: format!("prepare worker panicked: {msg}"),
                }),
                TaskOutcome::TimedOut => Err(ShardError::ShardUnavailable {
                    shard_id,
                    reason: format!("no vote within {timeout:?}"),
                }),
            };
            let vote = match result {
                Ok(()) => Vote::yes(shard_id),
                Err(e) => {
                    warn!(txn_id = %txn_id, shard_id, error = %e, "shard voted no");
                    self.notify(&txn_id, "on_error", |l| l.on_error(&txn_id, &e, Some(shard_id)));
                    let vote = Vote::no(shard_id, e.to_string());
                    if matches!(e, ShardError::PoolClosed { .. }) {
                        closed.get_or_insert(e);
                    } else {
                        rejected.push(format!("shard {shard_id}: {e}"));
                    }
                    vote
                }
            };
            let ready = vote.ready;
            ctx.record_vote(vote);
            self.notify(&txn_id, "on_vote", |l| l.on_vote(&txn_id, shard_id, ready));
        });

        if let Some(err) = closed {
            ctx.set_failure(err.to_string());
            ctx.transition(TxnState::Failed);
            return Err(err);
        }
        if rejected.is_empty() {
            ctx.transition(TxnState::Prepared);
            debug!(txn_id = %txn_id, "all shards prepared");
            return Ok(true);
        }
        rejected.sort();
        ctx.set_failure(rejected.join("; "));
        ctx.transition(TxnState::Failed);
        Ok(false)
    }

    /// Phase two. Valid only from `Prepared`.
    ///
    /// Waits for every shard to report its commit, without a deadline: a
    /// slow shard is never reported as failed while it may still commit.
    /// Every held connection is released whatever its outcome. If some shards
    /// committed and others did not, the transaction ends `Failed` and
    /// [`ShardError::PartialCommitFailure`] names both sets; there is no
    /// automatic recovery.
    pub fn commit(&self, ctx: &mut TransactionContext) -> Result<()> {
        Self::require(ctx, TxnState::Prepared, "commit")?;
        let phase = self.workers.start(ctx.held_shards().len())?;
        ctx.transition(TxnState::Committing);
        let txn_id = ctx.id().to_owned();
        let shards = ctx.shard_list();
        self.notify(&txn_id, "on_commit", |l| l.on_commit(&txn_id, &shards));

        let tasks: Vec<_> = ctx
            .take_held()
            .into_iter()
            .map(|(shard_id, conn)| {
                (shard_id, move || {
                    let result = participant::commit_shard(&conn);
                    drop(conn);
                    result
                })
            })
            .collect();

        let mut committed = Vec::new();
        let mut failed = Vec::new();
        phase.run_to_completion(tasks, |shard_id, outcome| {
            let err = match outcome {
                Ok(Ok(())) => {
                    committed.push(shard_id);
                    return;
                }
                Ok(Err(e)) => e,
                Err(msg) => ShardError::ShardUnavailable {
                    shard_id,
                    reason: format!("commit worker panicked: {msg}"),
                },
            };
            error!(txn_id = %txn_id, shard_id, error = %err, "shard failed to commit");
            self.notify(&txn_id, "on_error", |l| l.on_error(&txn_id, &err, Some(shard_id)));
            failed.push(shard_id);
        });

        if failed.is_empty() {
            ctx.finish(TxnState::Committed);
            info!(txn_id = %txn_id, ?shards, "transaction committed");
            self.complete(ctx);
            return Ok(());
        }

        committed.sort_unstable();
        failed.sort_unstable();
        let err = ShardError::PartialCommitFailure {
            txn_id: txn_id.clone(),
            committed,
            failed,
        };
        error!(txn_id = %txn_id, error = %err, "manual reconciliation required");
        ctx.set_failure(err.to_string());
        self.notify(&txn_id, "on_error", |l| l.on_error(&txn_id, &err, None));
        ctx.finish(TxnState::Failed);
        self.complete(ctx);
        Err(err)
    }

    /// Roll back every shard the transaction touched and release its
    /// connections. A no-op on a context that already completed.
    pub fn rollback(&self, ctx: &mut TransactionContext, reason: &str) -> Result<()> {
        if ctx.is_finalized() {
            debug!(txn_id = ctx.id(), state = %ctx.state(), "rollback ignored on completed transaction");
            return Ok(());
        }
        if !ctx.state().can_transition_to(TxnState::RollingBack) {
            return Err(ShardError::InvalidState {
                txn_id: ctx.id().to_owned(),
                state: ctx.state(),
                action: "roll back",
            });
        }
        let phase = self.workers.start(ctx.held_shards().len())?;
        ctx.transition(TxnState::RollingBack);
        if ctx.failure_reason().is_none() {
            ctx.set_failure(reason);
        }
        let txn_id = ctx.id().to_owned();
        let shards = ctx.shard_list();
        self.notify(&txn_id, "on_rollback", |l| l.on_rollback(&txn_id, &shards, reason));

        let tasks: Vec<_> = ctx
            .take_held()
            .into_iter()
            .map(|(shard_id, conn)| {
                (shard_id, move || {
                    let result = participant::rollback_shard(&conn);
                    drop(conn);
                    result
                })
            })
            .collect();

        phase.run_to_completion(tasks, |shard_id, outcome| {
            let err = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(msg) => ShardError::ShardUnavailable {
                    shard_id,
                    reason: format!("rollback worker panicked: {msg}"),
                },
            };
            warn!(txn_id = %txn_id, shard_id, error = %err, "shard rollback failed");
            self.notify(&txn_id, "on_error", |l| l.on_error(&txn_id, &err, Some(shard_id)));
        });

        ctx.finish(TxnState::RolledBack);
        info!(txn_id = %txn_id, reason, "transaction rolled back");
        self.complete(ctx);
        Ok(())
    }

    /// Begin, register `operations`, prepare and then commit or roll back.
    ///
    /// Returns `Ok(true)` when committed and `Ok(false)` when the shards
    /// rejected the transaction and it was rolled back.
    pub fn run(&self, keys: &[ShardKey], operations: Vec<Operation>) -> Result<bool> {
        let mut ctx = self.begin(keys)?;
        for op in operations {
            if let Err(e) = self.add_operation(&mut ctx, op) {
                self.rollback(&mut ctx, &format!("operation rejected: {e}"))?;
                return Err(e);
            }
        }
        match self.prepare(&mut ctx) {
            Ok(true) => {
                self.commit(&mut ctx)?;
                Ok(true)
            }
            Ok(false) => {
                let reason = format!(
                    "prepare failed: {}",
                    ctx.failure_reason().unwrap_or("unknown")
                );
                self.rollback(&mut ctx, &reason)?;
                Ok(false)
            }
            Err(e) => {
                self.rollback(&mut ctx, &format!("prepare failed: {e}"))?;
                Err(e)
            }
        }
    }

    /// Open a scoped transaction that rolls back unless committed.
    pub fn transaction(&self, keys: &[ShardKey]) -> Result<Transaction<'_>> {
        Ok(Transaction {
            coordinator: self,
            ctx: self.begin(keys)?,
        })
    }

    /// Run `f` inside a scoped transaction. Commits when `f` returns `Ok`;
    /// rolls back and returns the closure's error otherwise.
    pub fn with_transaction<F>(&self, keys: &[ShardKey], f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        let mut txn = self.transaction(keys)?;
        match f(&mut txn) {
            Ok(()) => txn.commit(),
            Err(e) => {
                txn.rollback(&format!("transaction scope failed: {e}"))?;
                Err(e)
            }
        }
    }

    fn pool(&self, shard_id: ShardId) -> Result<&Arc<ConnectionPool>> {
        self.pools
            .get(&shard_id)
            .ok_or(ShardError::UnknownShard(shard_id))
    }

    fn require(ctx: &TransactionContext, state: TxnState, action: &'static str) -> Result<()> {
        if ctx.state() != state {
            return Err(ShardError::InvalidState {
                txn_id: ctx.id().to_owned(),
                state: ctx.state(),
                action,
            });
        }
        Ok(())
    }

    fn complete(&self, ctx: &TransactionContext) {
        let (state, elapsed) = (ctx.state(), ctx.elapsed());
        self.notify(ctx.id(), "on_complete", |l| l.on_complete(ctx.id(), state, elapsed));
    }

    /// Invoke a logger hook, absorbing errors and panics.
    fn notify<F>(&self, txn_id: &str, hook: &'static str, call: F)
    where
        F: FnOnce(&dyn TransactionLogger) -> Result<()>,
    {
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| call(self.logger.as_ref()))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        self.logger_failures.fetch_add(1, Ordering::Relaxed);
        warn!(txn_id, hook, error = %failure, "transaction logger hook failed");
    }
}

/// Scoped transaction. Dropping it without a successful
/// [`commit`](Transaction::commit) rolls back every shard, including when
/// the scope unwinds from a panic.
pub struct Transaction<'c> {
    coordinator: &'c TransactionCoordinator,
    ctx: TransactionContext,
}

impl<'c> Transaction<'c> {
    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    pub fn context(&self) -> &TransactionContext {
        &self.ctx
    }

    pub fn add(&mut self, op: Operation) -> Result<&mut Self> {
        self.coordinator.add_operation(&mut self.ctx, op)?;
        Ok(self)
    }

    /// Prepare and commit. A rejected prepare rolls back and returns
    /// [`ShardError::PrepareFailure`].
    pub fn commit(mut self) -> Result<()> {
        let coordinator = self.coordinator;
        match coordinator.prepare(&mut self.ctx) {
            Ok(true) => coordinator.commit(&mut self.ctx),
            Ok(false) => {
                let reason = self
                    .ctx
                    .failure_reason()
                    .unwrap_or("prepare rejected")
                    .to_owned();
                coordinator.rollback(&mut self.ctx, &format!("prepare failed: {reason}"))?;
                Err(ShardError::PrepareFailure {
                    txn_id: self.ctx.id().to_owned(),
                    shards: self.ctx.rejected_shards(),
                    reason,
                })
            }
            Err(e) => {
                coordinator.rollback(&mut self.ctx, &format!("prepare failed: {e}"))?;
                Err(e)
            }
        }
    }

    pub fn rollback(mut self, reason: &str) -> Result<()> {
        self.coordinator.rollback(&mut self.ctx, reason)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.ctx.is_finalized() {
            return;
        }
        let reason = if thread::panicking() {
            "transaction scope panicked"
        } else {
            "transaction dropped without commit"
        };
        if let Err(e) = self.coordinator.rollback(&mut self.ctx, reason) {
            warn!(txn_id = self.ctx.id(), error = %e, "scoped rollback failed");
        }
    }
}
