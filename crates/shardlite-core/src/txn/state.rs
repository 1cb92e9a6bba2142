//! Transaction states and the transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::strategy::ShardId;

/// Lifecycle state of a cross-shard transaction.
///
/// Success path: `Initial → Preparing → Prepared → Committing → Committed`.
/// Failure path: `Preparing → Failed → RollingBack → RolledBack`, or
/// `Committing → Failed` when a shard cannot finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    Initial,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl TxnState {
    pub const ALL: [TxnState; 8] = [
        TxnState::Initial,
        TxnState::Preparing,
        TxnState::Prepared,
        TxnState::Committing,
        TxnState::Committed,
        TxnState::RollingBack,
        TxnState::RolledBack,
        TxnState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TxnState::Initial => "initial",
            TxnState::Preparing => "preparing",
            TxnState::Prepared => "prepared",
            TxnState::Committing => "committing",
            TxnState::Committed => "committed",
            TxnState::RollingBack => "rolling_back",
            TxnState::RolledBack => "rolled_back",
            TxnState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::RolledBack | TxnState::Failed
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Failed → RollingBack` is the single exit from a terminal state: a
    /// transaction whose prepare phase failed still has to release its shards.
    pub fn can_transition_to(self, next: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (self, next),
            (Initial, Preparing)
                | (Initial, RollingBack)
                | (Preparing, Prepared)
                | (Preparing, Failed)
                | (Prepared, Committing)
                | (Prepared, RollingBack)
                | (Committing, Committed)
                | (Committing, Failed)
                | (Failed, RollingBack)
                | (RollingBack, RolledBack)
        )
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shard's answer to the prepare request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub shard_id: ShardId,
    pub ready: bool,
    /// Why the shard voted no.
    pub reason: Option<String>,
}

impl Vote {
    pub fn yes(shard_id: ShardId) -> Self {
        Vote {
            shard_id,
            ready: true,
            reason: None,
        }
    }

    pub fn no(shard_id: ShardId, reason: impl Into<String>) -> Self {
        Vote {
            shard_id,
            ready: false,
            reason: Some(reason.into()),
        }
    }
}
