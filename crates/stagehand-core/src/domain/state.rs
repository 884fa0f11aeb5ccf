//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Claimed -> Running -> Done
/// - Pending -> Claimed -> Running -> Pending (retry, or "not finished yet")
/// - Pending -> Claimed -> Running -> Failed (max failures reached / invariant violation)
/// - Claimed | Running (lease expired) -> Claimed by another worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker.
    Pending,

    /// Leased by a worker, body not started yet.
    Claimed,

    /// Body is executing under a live lease.
    Running,

    /// Successfully completed.
    Done,

    /// Failed permanently. Needs operator intervention.
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Is this state leased (owner + expiry set)?
    pub fn is_leased(self) -> bool {
        matches!(self, TaskState::Claimed | TaskState::Running)
    }
}
