//! Transaction outcome metrics.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, ShardError};
use crate::strategy::ShardId;
use crate::txn::logger::TransactionLogger;
use crate::txn::state::TxnState;

/// Running totals over completed transactions.
#[derive(Debug, Clone, Default)]
pub struct TransactionMetrics {
    total: u64,
    committed: u64,
    failed: u64,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Duration,
    states: BTreeMap<TxnState, u64>,
    errors: BTreeMap<&'static str, u64>,
}

/// Serializable snapshot of [`TransactionMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub failed_transactions: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub state_distribution: BTreeMap<String, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

impl TransactionMetrics {
    pub fn record_completion(&mut self, state: TxnState, elapsed: Duration) {
        self.total += 1;
        if state == TxnState::Committed {
            self.committed += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration += elapsed;
        self.min_duration = Some(self.min_duration.map_or(elapsed, |m| m.min(elapsed)));
        self.max_duration = self.max_duration.max(elapsed);
        *self.states.entry(state).or_default() += 1;
    }

    pub fn record_error(&mut self, error: &ShardError) {
        *self.errors.entry(error.kind()).or_default() += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn count_for(&self, state: TxnState) -> u64 {
        self.states.get(&state).copied().unwrap_or(0)
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors.get(kind).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> MetricsSummary {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let (success_rate, avg) = if self.total == 0 {
            (0.0, 0.0)
        } else {
            (
                self.committed as f64 / self.total as f64,
                ms(self.total_duration) / self.total as f64,
            )
        };
        MetricsSummary {
            total_transactions: self.total,
            successful_transactions: self.committed,
            failed_transactions: self.failed,
            success_rate,
            avg_duration_ms: avg,
            min_duration_ms: self.min_duration.map_or(0.0, ms),
            max_duration_ms: ms(self.max_duration),
            state_distribution: self
                .states
                .iter()
                .map(|(s, n)| (s.to_string(), *n))
                .collect(),
            error_counts: self
                .errors
                .iter()
                .map(|(k, n)| ((*k).to_owned(), *n))
                .collect(),
        }
    }
}

/// Logger that aggregates [`TransactionMetrics`] from lifecycle events.
#[derive(Debug, Default)]
pub struct MetricsLogger {
    metrics: Mutex<TransactionMetrics>,
}

impl MetricsLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TransactionMetrics {
        self.metrics.lock().clone()
    }

    pub fn summary(&self) -> MetricsSummary {
        self.metrics.lock().summary()
    }

    pub fn reset(&self) {
        *self.metrics.lock() = TransactionMetrics::default();
    }
}

impl TransactionLogger for MetricsLogger {
    fn on_complete(&self, _txn_id: &str, state: TxnState, elapsed: Duration) -> Result<()> {
        self.metrics.lock().record_completion(state, elapsed);
        Ok(())
    }

    fn on_error(&self, _txn_id: &str, error: &ShardError, _shard_id: Option<ShardId>) -> Result<()> {
        self.metrics.lock().record_error(error);
        Ok(())
    }
}
