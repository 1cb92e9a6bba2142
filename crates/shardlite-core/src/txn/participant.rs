//! Shard-side steps of two-phase commit.
//!
//! Each function runs on a phase worker against a single shard's connection.
//! Prepare leaves the shard's local transaction open; commit and rollback
//! close it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rusqlite::Connection;

use crate::error::{Result, ShardError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::txn::context::Operation;
use crate::txn::workers::panic_message;

/// Result of preparing one shard. The connection is returned whenever one was
/// acquired so the coordinator can hold or release it.
pub(crate) struct Prepared {
    pub conn: Option<PooledConnection>,
    pub result: Result<()>,
}

/// Acquire a connection, open a write transaction, run the shard's operations
/// in order and check that the shard can commit.
pub(crate) fn prepare_shard(pool: &Arc<ConnectionPool>, operations: &[Operation]) -> Prepared {
    let shard_id = pool.shard_id();
    let conn = match pool.acquire() {
        Ok(conn) => conn,
        Err(e) => {
            return Prepared {
                conn: None,
                result: Err(e.into_unavailable(shard_id)),
            }
        }
    };

    if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
        return Prepared {
            conn: Some(conn),
            result: Err(ShardError::Sqlite(e).into_unavailable(shard_id)),
        };
    }

    let result = operations
        .iter()
        .try_for_each(|op| run_operation(op, &conn))
        .and_then(|()| check_ready(&conn));
    Prepared {
        conn: Some(conn),
        result,
    }
}

fn run_operation(op: &Operation, conn: &Connection) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| op.run(conn))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(ShardError::Operation(msg))) => {
            Err(ShardError::Operation(format!("{}: {msg}", op.label())))
        }
        Ok(Err(e)) => Err(ShardError::Operation(format!("{}: {e}", op.label()))),
        Err(payload) => Err(ShardError::Operation(format!(
            "{} panicked: {}",
            op.label(),
            panic_message(payload.as_ref())
        ))),
    }
}

/// A shard is ready when its local transaction is still open, the connection
/// answers, and no foreign key constraint is left violated.
fn check_ready(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        return Err(ShardError::Operation(
            "local transaction was closed by an operation".into(),
        ));
    }
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    if let Some(row) = rows.next()? {
        let table: String = row.get(0)?;
        return Err(ShardError::Operation(format!(
            "foreign key violation pending in table {table}"
        )));
    }
    Ok(())
}

pub(crate) fn commit_shard(conn: &Connection) -> Result<()> {
    conn.execute_batch("COMMIT")?;
    Ok(())
}

/// Roll back the shard's open transaction, if any.
pub(crate) fn rollback_shard(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    conn.execute_batch("ROLLBACK")?;
    Ok(())
}
