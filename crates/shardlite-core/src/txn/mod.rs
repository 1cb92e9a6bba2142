//! Cross-shard transactions: two-phase commit coordinator, shard-side steps,
//! lifecycle loggers and metrics.

pub mod context;
pub mod coordinator;
pub mod logger;
pub mod metrics;
mod participant;
pub mod state;
mod workers;

pub use context::{Operation, TransactionContext};
pub use coordinator::{CoordinatorConfig, Transaction, TransactionCoordinator};
pub use logger::{ConsoleLogger, NoopLogger, TracingLogger, TransactionLogger};
pub use metrics::{MetricsLogger, MetricsSummary, TransactionMetrics};
pub use state::{TxnState, Vote};
