//! Bounded worker pools that run one task per shard.
//!
//! Every phase invocation gets its own pool, so a phase blocked on a shard
//! lock never delays the commit or rollback of another transaction.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Result, ShardError};
use crate::strategy::ShardId;

/// How a shard task ended.
#[derive(Debug)]
pub(crate) enum TaskOutcome<T> {
    Done(T),
    Panicked(String),
    /// No result before the phase deadline. The task keeps running and its
    /// output is dropped on the worker thread when it finishes.
    TimedOut,
}

type Reported<T> = (ShardId, std::result::Result<T, String>);

/// Factory for per-phase worker pools of at most `max_workers` threads.
pub(crate) struct PhaseWorkers {
    max_workers: usize,
    name: &'static str,
}

impl PhaseWorkers {
    pub(crate) fn new(max_workers: usize, name: &'static str) -> Result<Self> {
        if max_workers == 0 {
            return Err(ShardError::Config("max_workers must be positive".into()));
        }
        Ok(Self { max_workers, name })
    }

    /// Start a dedicated pool for a phase over `shards` shards.
    pub(crate) fn start(&self, shards: usize) -> Result<Phase> {
        let name = self.name;
        let pool = ThreadPoolBuilder::new()
            .num_threads(shards.clamp(1, self.max_workers))
            .thread_name(move |i| format!("{name}-{i}"))
            .build()
            .map_err(|e| ShardError::Config(format!("cannot start worker pool: {e}")))?;
        Ok(Phase { pool })
    }
}

/// Workers for one phase. Dropping it lets spawned tasks run to completion
/// before its threads exit.
pub(crate) struct Phase {
    pool: ThreadPool,
}

impl Phase {
    fn spawn_all<T, F>(&self, tasks: Vec<(ShardId, F)>) -> (Receiver<Reported<T>>, BTreeSet<ShardId>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut pending = BTreeSet::new();
        for (shard_id, task) in tasks {
            pending.insert(shard_id);
            let tx = tx.clone();
            self.pool.spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                    .map_err(|payload| panic_message(payload.as_ref()));
                let _ = tx.send((shard_id, outcome));
            });
        }
        (rx, pending)
    }

    /// Run every task concurrently and report each outcome through `on_outcome`,
    /// in completion order. Shards that miss `timeout` are reported last as
    /// [`TaskOutcome::TimedOut`].
    pub(crate) fn run_until<T, F>(
        self,
        tasks: Vec<(ShardId, F)>,
        timeout: Duration,
        mut on_outcome: impl FnMut(ShardId, TaskOutcome<T>),
    ) where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (rx, mut pending) = self.spawn_all(tasks);
        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            match rx.recv_deadline(deadline) {
                Ok((shard_id, outcome)) => {
                    pending.remove(&shard_id);
                    on_outcome(
                        shard_id,
                        match outcome {
                            Ok(value) => TaskOutcome::Done(value),
                            Err(msg) => TaskOutcome::Panicked(msg),
                        },
                    );
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for shard_id in pending {
            on_outcome(shard_id, TaskOutcome::TimedOut);
        }
    }

    /// Run every task and wait for all of them, however long they take. An
    /// `Err` carries the panic message of a task that unwound.
    pub(crate) fn run_to_completion<T, F>(
        self,
        tasks: Vec<(ShardId, F)>,
        mut on_outcome: impl FnMut(ShardId, std::result::Result<T, String>),
    ) where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (rx, mut pending) = self.spawn_all(tasks);
        for (shard_id, outcome) in rx.iter() {
            pending.remove(&shard_id);
            on_outcome(shard_id, outcome);
        }
        for shard_id in pending {
            on_outcome(shard_id, Err("worker exited without reporting".into()));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
