//! Execution history: one entry per finished attempt.
//!
//! Records:
//! - who ran it (worker)
//! - when (started_at / ended_at)
//! - what happened (result + error)
//!
//! Operators read this to explain why a task ended up `Failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};
use super::task_type::TaskTypeName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptResult {
    /// Body finished the task.
    Done,

    /// Body asked to be rescheduled (`Ok(false)`), no failure counted.
    Continued,

    /// Body failed, task went back to Pending.
    Requeued,

    /// Body failed, task is terminally Failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: TaskId,
    pub task_type: TaskTypeName,
    pub worker: WorkerId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub result: AttemptResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_result_serializes_as_screaming_snake_case() {
        let s = serde_json::to_string(&AttemptResult::Requeued).unwrap();
        assert_eq!(s, "\"REQUEUED\"");
    }
}
