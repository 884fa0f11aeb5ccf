//! FailureTracker - 失敗回数の加算と終端判定
//!
//! # 流れ
//! 1. `decide()`（純粋関数）で Requeue / Fail を決める
//! 2. owner ガード付きで store に書く（履歴も同時に）
//!
//! Declined admission, lost claim races and expired-lease takeovers never
//! reach this module, so they never count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::domain::{AttemptResult, HistoryEntry, TaskError, TaskRecord, WorkerId};
use crate::ports::{StoreError, TaskStore, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// 新しい回数で Pending に戻す
    Requeue { failure_count: u32 },

    /// 終端
    Fail { failure_count: u32 },
}

impl FailureDecision {
    pub fn failure_count(&self) -> u32 {
        match self {
            FailureDecision::Requeue { failure_count } | FailureDecision::Fail { failure_count } => {
                *failure_count
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureDecision::Fail { .. })
    }
}

/// `max_failures == 0` なら transient エラーで終端にはならない
pub fn decide(previous_failures: u32, max_failures: u32, err: &TaskError) -> FailureDecision {
    let failure_count = previous_failures.saturating_add(1);
    if !err.is_retryable() {
        return FailureDecision::Fail { failure_count };
    }
    if max_failures == 0 || failure_count < max_failures {
        FailureDecision::Requeue { failure_count }
    } else {
        FailureDecision::Fail { failure_count }
    }
}

pub struct FailureTracker {
    store: Arc<dyn TaskStore>,
}

impl FailureTracker {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// `worker` が実行した `record` の失敗を 1 回数える
    ///
    /// 書く前に lease を失っていたら `None`。その試行は何も残さず、
    /// 結果は新しい所有者の試行が決める。
    pub async fn record_failure(
        &self,
        record: &TaskRecord,
        max_failures: u32,
        worker: WorkerId,
        err: &TaskError,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureDecision>, StoreError> {
        let decision = decide(record.failure_count, max_failures, err);
        let message = err.to_string();

        let (transition, result) = match decision {
            FailureDecision::Requeue { failure_count } => (
                Transition::Requeue {
                    failure_count,
                    error: Some(message.clone()),
                },
                AttemptResult::Requeued,
            ),
            FailureDecision::Fail { failure_count } => (
                Transition::Fail {
                    failure_count,
                    error: message.clone(),
                },
                AttemptResult::Failed,
            ),
        };
        let entry = HistoryEntry {
            task_id: record.id,
            task_type: record.task_type.clone(),
            worker,
            started_at,
            ended_at: now,
            result,
            error: Some(message.clone()),
        };

        if !self.store.finalize(record.id, worker, transition, entry, now).await? {
            return Ok(None);
        }

        match decision {
            FailureDecision::Requeue { failure_count } => warn!(
                task_id = %record.id,
                stage = %record.task_type,
                failure_count,
                max_failures,
                error = %message,
                "attempt failed, requeued"
            ),
            FailureDecision::Fail { failure_count } => error!(
                task_id = %record.id,
                stage = %record.task_type,
                failure_count,
                error = %message,
                "task failed permanently"
            ),
        }
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Resources, TaskId, TaskState, TaskTypeName};
    use crate::impls::InMemoryTaskStore;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case::first_of_three(0, 3, FailureDecision::Requeue { failure_count: 1 })]
    #[case::second_of_three(1, 3, FailureDecision::Requeue { failure_count: 2 })]
    #[case::third_of_three(2, 3, FailureDecision::Fail { failure_count: 3 })]
    #[case::bound_of_one(0, 1, FailureDecision::Fail { failure_count: 1 })]
    #[case::unbounded(41, 0, FailureDecision::Requeue { failure_count: 42 })]
    fn transient_errors_count_toward_the_bound(
        #[case] previous: u32,
        #[case] max_failures: u32,
        #[case] expected: FailureDecision,
    ) {
        assert_eq!(decide(previous, max_failures, &TaskError::transient("io")), expected);
    }

    #[rstest]
    #[case::bounded(3)]
    #[case::unbounded(0)]
    fn invariant_errors_fail_immediately(#[case] max_failures: u32) {
        let decision = decide(0, max_failures, &TaskError::invariant("expected 1 sector, got 2"));
        assert_eq!(decision, FailureDecision::Fail { failure_count: 1 });
    }

    #[tokio::test]
    async fn record_failure_is_guarded_by_ownership() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let store = Arc::new(InMemoryTaskStore::new());
        let id = TaskId::from_ulid(Ulid::new());
        store
            .insert_task(id, NewTask::new(TaskTypeName::new("SDRTrees"), Resources::ZERO), t0)
            .await
            .unwrap();
        let tracker = FailureTracker::new(store.clone());
        let (a, b) = (WorkerId::from_ulid(Ulid::new()), WorkerId::from_ulid(Ulid::new()));

        store.try_claim(id, a, t0 + Duration::seconds(30), t0).await.unwrap();
        let record = store.get_task(id).await.unwrap().unwrap();

        // b never owned it
        let lost = tracker
            .record_failure(&record, 3, b, &TaskError::transient("io"), t0, t0)
            .await
            .unwrap();
        assert_eq!(lost, None);

        let applied = tracker
            .record_failure(&record, 3, a, &TaskError::transient("io"), t0, t0)
            .await
            .unwrap();
        assert_eq!(applied, Some(FailureDecision::Requeue { failure_count: 1 }));

        let row = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(row.state, TaskState::Pending);
        assert_eq!(row.failure_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("io"));
        assert_eq!(store.history(id).await.unwrap().len(), 1);
    }
}
