//! Stage trait - 各パイプライン段（タスク種別）が実装する契約
//!
//! # 使用例
//! ```ignore
//! struct Trees;
//!
//! #[async_trait]
//! impl Stage for Trees {
//!     fn details(&self) -> StageDetails {
//!         StageDetails::new("SDRTrees")
//!             .with_cost(Resources::new(1, 1, 8000))
//!             .with_max_failures(3)
//!             .following(["PreCommit2"])
//!     }
//!
//!     async fn execute(&self, task: TaskContext, probe: OwnershipProbe) -> Result<bool, TaskError> {
//!         for layer in 0..11 {
//!             if !probe.still_owned().await {
//!                 return Ok(false);
//!             }
//!             build_layer(&task, layer).await?;
//!         }
//!         Ok(true)
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use super::adder::AddTaskHandle;
use super::probe::OwnershipProbe;
use crate::domain::{PipelineKey, Resources, StageDetails, TaskError, TaskId, TaskRecord, TaskTypeName, WorkerId};
use crate::ports::{StoreError, TaskStore};

#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// 登録時に 1 度だけ読まれる記述子
    fn details(&self) -> StageDetails;

    /// 本体を実行する
    ///
    /// - `Ok(true)`: 完了
    /// - `Ok(false)`: 未完了。失敗を数えずに Pending に戻す
    /// - `Err(_)`: 失敗として数える（`TaskError::Invariant` なら即終端）
    async fn execute(&self, task: TaskContext, probe: OwnershipProbe) -> Result<bool, TaskError>;

    /// `candidates`（容量で絞り込み済み、古い順）から 1 件選ぶ
    /// `None` はこの回の辞退
    async fn can_accept(
        &self,
        candidates: &[TaskId],
        view: &SchedulerView,
    ) -> Result<Option<TaskId>, TaskError> {
        let _ = view;
        Ok(candidates.first().copied())
    }

    /// `EngineBuilder::build` から 1 度だけ呼ばれる
    /// この stage の行を挿入するハンドルを受け取る（DAG の外から供給される stage 向け）
    fn on_register(&self, adder: AddTaskHandle) {
        let _ = adder;
    }
}

/// TaskContext は本体から見えるタスク行
#[derive(Debug, Clone)]
pub struct TaskContext {
    record: TaskRecord,
}

impl TaskContext {
    pub fn new(record: TaskRecord) -> Self {
        Self { record }
    }

    pub fn id(&self) -> TaskId {
        self.record.id
    }

    pub fn pipeline(&self) -> Option<&PipelineKey> {
        self.record.pipeline.as_ref()
    }

    /// この試行より前に記録された失敗回数
    pub fn previous_failures(&self) -> u32 {
        self.record.failure_count
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.record.payload
    }

    /// payload をデコードする
    /// `T` に合わない payload は invariant 違反（リトライでは直らない）
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        Ok(serde_json::from_value(self.record.payload.clone())?)
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }
}

/// SchedulerView は `Stage::can_accept` に渡されるワーカーの読み取り専用スナップショット
#[derive(Clone)]
pub struct SchedulerView {
    pub worker: WorkerId,
    pub capacity: Resources,
    pub available: Resources,
    pub running: BTreeMap<TaskTypeName, usize>,
    pub now: DateTime<Utc>,
    store: Arc<dyn TaskStore>,
}

impl SchedulerView {
    pub fn new(
        worker: WorkerId,
        capacity: Resources,
        available: Resources,
        running: BTreeMap<TaskTypeName, usize>,
        now: DateTime<Utc>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            worker,
            capacity,
            available,
            running,
            now,
            store,
        }
    }

    /// このワーカーで実行中の `stage` の数
    pub fn running_of(&self, stage: &TaskTypeName) -> usize {
        self.running.get(stage).copied().unwrap_or(0)
    }

    /// 判断材料として候補の行（payload・失敗回数）を引く
    /// 読み取り専用: admission は store に書かない
    pub async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.store.get_task(id).await
    }
}

impl std::fmt::Debug for SchedulerView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerView")
            .field("worker", &self.worker)
            .field("capacity", &self.capacity)
            .field("available", &self.available)
            .field("running", &self.running)
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use crate::impls::InMemoryTaskStore;
    use chrono::TimeZone;
    use serde::Deserialize;
    use ulid::Ulid;

    struct Oldest;

    #[async_trait]
    impl Stage for Oldest {
        fn details(&self) -> StageDetails {
            StageDetails::new("SDR")
        }

        async fn execute(&self, _task: TaskContext, _probe: OwnershipProbe) -> Result<bool, TaskError> {
            Ok(true)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn view_over(store: Arc<InMemoryTaskStore>) -> SchedulerView {
        SchedulerView::new(
            WorkerId::from_ulid(Ulid::new()),
            Resources::new(4, 1, 16_000),
            Resources::new(4, 1, 16_000),
            BTreeMap::new(),
            now(),
            store,
        )
    }

    fn view() -> SchedulerView {
        view_over(Arc::new(InMemoryTaskStore::new()))
    }

    /// 失敗回数が最も少ない候補を選ぶ
    struct FewestFailures;

    #[async_trait]
    impl Stage for FewestFailures {
        fn details(&self) -> StageDetails {
            StageDetails::new("SDR")
        }

        async fn execute(&self, _task: TaskContext, _probe: OwnershipProbe) -> Result<bool, TaskError> {
            Ok(true)
        }

        async fn can_accept(
            &self,
            candidates: &[TaskId],
            view: &SchedulerView,
        ) -> Result<Option<TaskId>, TaskError> {
            let mut best: Option<(u32, TaskId)> = None;
            for id in candidates {
                let Some(row) = view
                    .task(*id)
                    .await
                    .map_err(|e| TaskError::transient(e.to_string()))?
                else {
                    continue;
                };
                if best.is_none_or(|(n, _)| row.failure_count < n) {
                    best = Some((row.failure_count, *id));
                }
            }
            Ok(best.map(|(_, id)| id))
        }
    }

    #[tokio::test]
    async fn admission_can_read_candidate_rows() {
        let store = Arc::new(InMemoryTaskStore::new());
        let ids = [
            TaskId::from_ulid(Ulid::from_parts(1, 0)),
            TaskId::from_ulid(Ulid::from_parts(2, 0)),
        ];
        for id in ids {
            store
                .insert_task(id, NewTask::new(TaskTypeName::new("SDR"), Resources::ZERO), now())
                .await
                .unwrap();
        }
        // first row has a failure behind it
        let worker = WorkerId::from_ulid(Ulid::new());
        store
            .try_claim(ids[0], worker, now() + chrono::Duration::seconds(30), now())
            .await
            .unwrap();
        let requeue = crate::ports::Transition::Requeue {
            failure_count: 1,
            error: Some("io".into()),
        };
        let entry = crate::domain::HistoryEntry {
            task_id: ids[0],
            task_type: TaskTypeName::new("SDR"),
            worker,
            started_at: now(),
            ended_at: now(),
            result: crate::domain::AttemptResult::Requeued,
            error: Some("io".into()),
        };
        store.finalize(ids[0], worker, requeue, entry, now()).await.unwrap();

        let picked = FewestFailures.can_accept(&ids, &view_over(store)).await.unwrap();
        assert_eq!(picked, Some(ids[1]));
    }

    #[tokio::test]
    async fn default_admission_takes_the_first_candidate() {
        let ids = [
            TaskId::from_ulid(Ulid::from_parts(1, 0)),
            TaskId::from_ulid(Ulid::from_parts(2, 0)),
        ];
        let picked = Oldest.can_accept(&ids, &view()).await.unwrap();
        assert_eq!(picked, Some(ids[0]));
        assert_eq!(Oldest.can_accept(&[], &view()).await.unwrap(), None);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sector {
        miner: u64,
        number: u64,
    }

    #[test]
    fn payload_decodes_or_reports_invariant() {
        let record = TaskRecord::from_new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new(TaskTypeName::new("SDR"), Resources::ZERO)
                .with_payload(serde_json::json!({"miner": 1000, "number": 7})),
            now(),
        );
        let ctx = TaskContext::new(record.clone());
        assert_eq!(ctx.decode_payload::<Sector>().unwrap(), Sector { miner: 1000, number: 7 });

        let bad = TaskContext::new(TaskRecord {
            payload: serde_json::json!({"miner": "x"}),
            ..record
        });
        let err = bad.decode_payload::<Sector>().unwrap_err();
        assert!(!err.is_retryable());
    }
}
