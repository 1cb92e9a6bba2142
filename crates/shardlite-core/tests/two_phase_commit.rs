use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::Connection;
use shardlite_core::{
    Operation, Result, ShardError, ShardId, ShardManager, ShardliteConfig, TransactionLogger,
    TxnState,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingLogger {
    events: Mutex<Vec<String>>,
}

impl RecordingLogger {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

impl TransactionLogger for RecordingLogger {
    fn on_prepare(&self, _txn_id: &str, shards: &[ShardId]) -> Result<()> {
        self.push(format!("prepare {shards:?}"))
    }

    fn on_vote(&self, _txn_id: &str, shard_id: ShardId, ready: bool) -> Result<()> {
        self.push(format!("vote {shard_id} {ready}"))
    }

    fn on_commit(&self, _txn_id: &str, shards: &[ShardId]) -> Result<()> {
        self.push(format!("commit {shards:?}"))
    }

    fn on_rollback(&self, _txn_id: &str, _shards: &[ShardId], reason: &str) -> Result<()> {
        self.push(format!("rollback {reason}"))
    }

    fn on_complete(&self, _txn_id: &str, state: TxnState, _elapsed: Duration) -> Result<()> {
        self.push(format!("complete {state}"))
    }

    fn on_error(&self, _txn_id: &str, error: &ShardError, shard_id: Option<ShardId>) -> Result<()> {
        self.push(format!("error {shard_id:?} {}", error.kind()))
    }
}

fn open_manager(dir: &TempDir, logger: Arc<dyn TransactionLogger>) -> ShardManager {
    open_with_timeout(dir, logger, 60.0)
}

fn open_with_timeout(
    dir: &TempDir,
    logger: Arc<dyn TransactionLogger>,
    phase_timeout_secs: f64,
) -> ShardManager {
    let config = ShardliteConfig {
        phase_timeout_secs,
        ..ShardliteConfig::with_dir(dir.path())
    };
    open_configured(config, logger)
}

fn open_configured(config: ShardliteConfig, logger: Arc<dyn TransactionLogger>) -> ShardManager {
    let config = ShardliteConfig {
        num_shards: 4,
        ..config
    };
    let manager = ShardManager::open_with(config, None, Some(logger)).unwrap();
    manager
        .apply_schema("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER NOT NULL)")
        .unwrap();
    manager
}

fn insert_account(key: i64, balance: i64) -> Operation {
    Operation::new(key, move |conn| {
        conn.execute(
            "INSERT INTO accounts (id, balance) VALUES (?1, ?2)",
            (key, balance),
        )?;
        Ok(())
    })
    .labeled(format!("insert account {key}"))
}

fn rows_on(manager: &ShardManager, shard_id: ShardId) -> i64 {
    manager
        .router()
        .on_shard(shard_id, |c| {
            Ok(c.query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))?)
        })
        .unwrap()
}

fn assert_all_released(manager: &ShardManager) {
    for (shard_id, stats) in manager.pool_stats() {
        assert_eq!(stats.active, 0, "shard {shard_id} still has a checked-out connection");
    }
}

#[test]
fn commit_applies_writes_on_every_shard() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_manager(&dir, logger.clone());

    let committed = manager
        .run_transaction(&[0, 1], vec![insert_account(0, 100), insert_account(1, 50)])
        .unwrap();

    assert!(committed);
    assert_eq!(rows_on(&manager, 0), 1);
    assert_eq!(rows_on(&manager, 1), 1);
    assert_all_released(&manager);

    let events = logger.events();
    assert_eq!(events[0], "prepare [0, 1]");
    assert_eq!(logger.count("vote"), 2);
    assert!(events.contains(&"vote 0 true".to_string()));
    assert!(events.contains(&"vote 1 true".to_string()));
    assert_eq!(events[3], "commit [0, 1]");
    assert_eq!(events.last().unwrap(), "complete committed");
    assert_eq!(logger.count("rollback"), 0);
}

#[test]
fn keys_resolve_to_owning_shards() {
    let dir = TempDir::new().unwrap();
    let manager = open_manager(&dir, Arc::new(RecordingLogger::default()));
    let coordinator = manager.coordinator();

    let mut ctx = coordinator.begin(&[123, 456]).unwrap();
    assert_eq!(ctx.shard_ids().iter().copied().collect::<Vec<_>>(), vec![0, 3]);
    coordinator.add_operation(&mut ctx, insert_account(123, 1)).unwrap();
    coordinator.add_operation(&mut ctx, insert_account(456, 1)).unwrap();
    assert!(coordinator.prepare(&mut ctx).unwrap());
    coordinator.commit(&mut ctx).unwrap();
    assert_eq!(ctx.state(), TxnState::Committed);
    assert_eq!(rows_on(&manager, 3), 1);
    assert_eq!(rows_on(&manager, 0), 1);
}

#[test]
fn failing_operation_rolls_back_every_shard() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_manager(&dir, logger.clone());

    // 456 lives on shard 0, 123 on shard 3.
    let failing = Operation::new(456, |_| Err(ShardError::Operation("insufficient funds".into())))
        .labeled("debit");
    let committed = manager
        .run_transaction(&[123, 456], vec![insert_account(123, 50), failing])
        .unwrap();

    assert!(!committed);
    assert_eq!(rows_on(&manager, 0), 0);
    assert_eq!(rows_on(&manager, 3), 0);
    assert_all_released(&manager);

    let events = logger.events();
    assert_eq!(events[0], "prepare [0, 3]");
    assert!(events.contains(&"vote 0 false".to_string()));
    assert!(events.contains(&"vote 3 true".to_string()));
    assert_eq!(logger.count("commit"), 0);
    let rollback = events.iter().find(|e| e.starts_with("rollback")).unwrap();
    assert!(rollback.contains("shard 0"), "{rollback}");
    assert!(rollback.contains("insufficient funds"), "{rollback}");
    assert_eq!(events.last().unwrap(), "complete rolled_back");
}

#[test]
fn earlier_writes_on_failing_shard_are_undone() {
    let dir = TempDir::new().unwrap();
    let manager = open_manager(&dir, Arc::new(RecordingLogger::default()));

    // Key 4 lives on shard 0 next to key 0; the duplicate id fails after
    // two successful inserts on the same shard.
    let committed = manager
        .run_transaction(
            &[0, 1, 4],
            vec![
                insert_account(0, 1),
                insert_account(4, 1),
                insert_account(1, 1),
                insert_account(4, 2),
            ],
        )
        .unwrap();

    assert!(!committed);
    for shard in 0..4 {
        assert_eq!(rows_on(&manager, shard), 0);
    }
}

#[test]
fn states_advance_in_order() {
    let dir = TempDir::new().unwrap();
    let manager = open_manager(&dir, Arc::new(RecordingLogger::default()));
    let coordinator = manager.coordinator();

    let mut ctx = coordinator.begin(&[2, 3]).unwrap();
    assert_eq!(ctx.state(), TxnState::Initial);
    coordinator.add_operation(&mut ctx, insert_account(2, 7)).unwrap();
    coordinator.add_operation(&mut ctx, insert_account(3, 7)).unwrap();

    assert!(coordinator.prepare(&mut ctx).unwrap());
    assert_eq!(ctx.state(), TxnState::Prepared);
    assert_eq!(ctx.held_shards(), vec![2, 3]);
    assert!(ctx.votes().values().all(|v| v.ready));

    coordinator.commit(&mut ctx).unwrap();
    assert_eq!(ctx.state(), TxnState::Committed);
    assert!(ctx.is_finalized());
    assert!(ctx.held_shards().is_empty());

    coordinator.rollback(&mut ctx, "too late").unwrap();
    assert_eq!(ctx.state(), TxnState::Committed);
    assert!(matches!(
        coordinator.add_operation(&mut ctx, insert_account(2, 1)),
        Err(ShardError::InvalidState { .. })
    ));
    assert!(matches!(
        coordinator.prepare(&mut ctx),
        Err(ShardError::InvalidState { .. })
    ));
    assert!(matches!(
        coordinator.commit(&mut ctx),
        Err(ShardError::InvalidState { .. })
    ));
    assert_eq!(ctx.state(), TxnState::Committed);
    assert_eq!(rows_on(&manager, 2), 1);
}

#[test]
fn rollback_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_manager(&dir, logger.clone());
    let coordinator = manager.coordinator();

    let mut ctx = coordinator.begin(&[1]).unwrap();
    coordinator
        .add_operation(
            &mut ctx,
            Operation::new(1, |_| Err(ShardError::Operation("no".into()))),
        )
        .unwrap();
    assert!(!coordinator.prepare(&mut ctx).unwrap());
    assert_eq!(ctx.state(), TxnState::Failed);
    assert_eq!(ctx.held_shards(), vec![1]);

    coordinator.rollback(&mut ctx, "first").unwrap();
    coordinator.rollback(&mut ctx, "second").unwrap();
    assert_eq!(ctx.state(), TxnState::RolledBack);
    assert_eq!(logger.count("rollback"), 1);
    assert_eq!(logger.count("complete"), 1);
    assert_all_released(&manager);
}

#[test]
fn shard_that_cannot_finalize_reports_partial_commit() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_manager(&dir, logger.clone());
    let coordinator = manager.coordinator();

    let mut ctx = coordinator.begin(&[0, 1]).unwrap();
    coordinator.add_operation(&mut ctx, insert_account(0, 10)).unwrap();
    coordinator.add_operation(&mut ctx, insert_account(1, 10)).unwrap();
    // Veto the next COMMIT on shard 1 only.
    let veto = Operation::new(1, |conn: &Connection| {
        let fired = AtomicBool::new(false);
        conn.commit_hook(Some(move || !fired.swap(true, Ordering::SeqCst)));
        Ok(())
    });
    coordinator.add_operation(&mut ctx, veto).unwrap();

    assert!(coordinator.prepare(&mut ctx).unwrap());
    let err = coordinator.commit(&mut ctx).unwrap_err();
    match err {
        ShardError::PartialCommitFailure {
            committed, failed, ..
        } => {
            assert_eq!(committed, vec![0]);
            assert_eq!(failed, vec![1]);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(ctx.state(), TxnState::Failed);
    assert!(ctx.is_finalized());
    assert_eq!(rows_on(&manager, 0), 1);
    assert_eq!(rows_on(&manager, 1), 0);
    assert_all_released(&manager);

    assert!(logger.events().contains(&"error None PartialCommitFailure".to_string()));
    assert_eq!(logger.events().last().unwrap(), "complete failed");

    coordinator.rollback(&mut ctx, "after the fact").unwrap();
    assert_eq!(ctx.state(), TxnState::Failed);
}

#[test]
fn slow_shard_times_out_and_votes_no() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_with_timeout(&dir, logger.clone(), 0.1);

    let slow = Operation::new(1, |conn| {
        conn.execute("INSERT INTO accounts (id, balance) VALUES (1, 1)", [])?;
        std::thread::sleep(Duration::from_millis(600));
        Ok(())
    });
    let committed = manager
        .run_transaction(&[0, 1], vec![insert_account(0, 1), slow])
        .unwrap();

    assert!(!committed);
    assert!(logger.events().contains(&"vote 1 false".to_string()));
    assert_eq!(rows_on(&manager, 0), 0);

    // The straggler releases its connection, rolled back, once it finishes.
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.pool_stats()[&1].active > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_all_released(&manager);
    assert_eq!(rows_on(&manager, 1), 0);
}

#[test]
fn commit_waits_for_slow_shard_beyond_phase_timeout() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_with_timeout(&dir, logger.clone(), 0.2);
    let coordinator = manager.coordinator();

    let mut ctx = coordinator.begin(&[0, 1]).unwrap();
    coordinator.add_operation(&mut ctx, insert_account(0, 1)).unwrap();
    coordinator.add_operation(&mut ctx, insert_account(1, 1)).unwrap();
    // Stall the next COMMIT on shard 0 past the phase timeout, then allow it.
    let slow_commit = Operation::new(0, |conn: &Connection| {
        let fired = AtomicBool::new(false);
        conn.commit_hook(Some(move || {
            if !fired.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(600));
            }
            false
        }));
        Ok(())
    });
    coordinator.add_operation(&mut ctx, slow_commit).unwrap();
    assert!(coordinator.prepare(&mut ctx).unwrap());

    let started = Instant::now();
    coordinator.commit(&mut ctx).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(ctx.state(), TxnState::Committed);
    assert_eq!(rows_on(&manager, 0), 1);
    assert_eq!(rows_on(&manager, 1), 1);
    assert_all_released(&manager);
    assert_eq!(logger.count("error"), 0);
    assert_eq!(logger.events().last().unwrap(), "complete committed");
}

#[test]
fn contending_transactions_on_one_shard_both_commit() {
    let dir = TempDir::new().unwrap();
    let config = ShardliteConfig {
        max_workers: 1,
        connection_timeout_secs: 3.0,
        ..ShardliteConfig::with_dir(dir.path())
    };
    let manager = open_configured(config, Arc::new(RecordingLogger::default()));
    let coordinator = manager.coordinator();

    let mut first = coordinator.begin(&[0]).unwrap();
    coordinator.add_operation(&mut first, insert_account(0, 1)).unwrap();
    assert!(coordinator.prepare(&mut first).unwrap());

    std::thread::scope(|s| {
        // Key 4 shares shard 0, so this prepare waits on the first write lock.
        let second = s.spawn(|| manager.run_transaction(&[4], vec![insert_account(4, 1)]));
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        coordinator.commit(&mut first).unwrap();
        let waited = started.elapsed();
        assert!(waited < Duration::from_secs(1), "commit waited {waited:?}");

        assert!(second.join().unwrap().unwrap());
    });

    assert_eq!(first.state(), TxnState::Committed);
    assert_eq!(rows_on(&manager, 0), 2);
    assert_all_released(&manager);
}

#[test]
fn scoped_transaction_rolls_back_when_dropped() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_manager(&dir, logger.clone());

    {
        let mut txn = manager.transaction(&[0, 1]).unwrap();
        txn.add(insert_account(0, 5)).unwrap();
    }
    assert_eq!(logger.events(), vec![
        "rollback transaction dropped without commit".to_string(),
        "complete rolled_back".to_string(),
    ]);
    assert_eq!(rows_on(&manager, 0), 0);

    let mut txn = manager.transaction(&[0, 1]).unwrap();
    txn.add(insert_account(0, 5))
        .unwrap()
        .add(insert_account(1, 5))
        .unwrap();
    txn.commit().unwrap();
    assert_eq!(rows_on(&manager, 0), 1);
    assert_eq!(rows_on(&manager, 1), 1);
}

#[test]
fn scoped_transaction_rolls_back_on_panic() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_manager(&dir, logger.clone());

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut txn = manager.transaction(&[2]).unwrap();
        txn.add(insert_account(2, 5)).unwrap();
        panic!("application bug");
    }));
    assert!(outcome.is_err());
    assert!(logger
        .events()
        .contains(&"rollback transaction scope panicked".to_string()));
    assert_eq!(rows_on(&manager, 2), 0);
}

#[test]
fn scoped_commit_reports_prepare_failure() {
    let dir = TempDir::new().unwrap();
    let manager = open_manager(&dir, Arc::new(RecordingLogger::default()));

    let mut txn = manager.transaction(&[0, 3]).unwrap();
    txn.add(insert_account(0, 1)).unwrap();
    txn.add(Operation::new(3, |_| Err(ShardError::Operation("rejected".into()))))
        .unwrap();
    match txn.commit() {
        Err(ShardError::PrepareFailure { shards, reason, .. }) => {
            assert_eq!(shards, vec![3]);
            assert!(reason.contains("rejected"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(rows_on(&manager, 0), 0);
}

#[test]
fn with_transaction_commits_or_returns_closure_error() {
    let dir = TempDir::new().unwrap();
    let manager = open_manager(&dir, Arc::new(RecordingLogger::default()));

    manager
        .with_transaction(&[1, 2], |txn| {
            txn.add(insert_account(1, 1))?;
            txn.add(insert_account(2, 1))?;
            Ok(())
        })
        .unwrap();
    assert_eq!(rows_on(&manager, 1), 1);

    let err = manager
        .with_transaction(&[1, 2], |txn| {
            txn.add(insert_account(5, 1))?;
            Err(ShardError::Operation("changed plans".into()))
        })
        .unwrap_err();
    assert!(matches!(err, ShardError::Operation(_)));
    assert_eq!(rows_on(&manager, 1), 1);
    assert_all_released(&manager);
}

#[test]
fn operation_outside_transaction_shards_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = open_manager(&dir, Arc::new(RecordingLogger::default()));

    let err = manager
        .run_transaction(&[0], vec![insert_account(0, 1), insert_account(1, 1)])
        .unwrap_err();
    assert!(matches!(err, ShardError::InvalidKey { key: 1, .. }));
    assert_eq!(rows_on(&manager, 0), 0);
    assert!(matches!(
        manager.run_transaction(&[], vec![]),
        Err(ShardError::EmptyTransaction)
    ));
}

struct FaultyLogger {
    panic_on_vote: bool,
}

impl TransactionLogger for FaultyLogger {
    fn on_prepare(&self, _txn_id: &str, _shards: &[ShardId]) -> Result<()> {
        Err(ShardError::LoggerFailure("disk full".into()))
    }

    fn on_vote(&self, _txn_id: &str, _shard_id: ShardId, _ready: bool) -> Result<()> {
        if self.panic_on_vote {
            panic!("logger bug");
        }
        Ok(())
    }
}

#[test]
fn logger_failures_do_not_change_outcome() {
    let dir = TempDir::new().unwrap();
    let manager = open_manager(&dir, Arc::new(FaultyLogger { panic_on_vote: true }));

    let committed = manager
        .run_transaction(&[0, 1], vec![insert_account(0, 1), insert_account(1, 1)])
        .unwrap();
    assert!(committed);
    assert_eq!(rows_on(&manager, 0), 1);
    // one failed on_prepare plus two panicking on_vote calls
    assert_eq!(manager.coordinator().logger_failures(), 3);
}

#[test]
fn closed_pool_fails_prepare() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(RecordingLogger::default());
    let manager = open_manager(&dir, logger.clone());
    manager.shutdown();

    let err = manager
        .run_transaction(&[0], vec![insert_account(0, 1)])
        .unwrap_err();
    assert!(matches!(err, ShardError::PoolClosed { shard_id: 0 }));
    assert_eq!(logger.events().last().unwrap(), "complete rolled_back");
}
