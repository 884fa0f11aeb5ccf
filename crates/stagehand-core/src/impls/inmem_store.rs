//! InMemoryTaskStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - 全テーブルを 1 つの `tokio::sync::Mutex` で保護する（= serializable）
//! - ロックは各メソッド内で完結し、await を跨がない
//!
//! Several engines sharing one `Arc<InMemoryTaskStore>` behave like several
//! worker processes sharing one database: every claim or finalize is a single
//! critical section, so racing claims are linearized and exactly one wins.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    HistoryEntry, InsertOutcome, NewTask, PipelineKey, PipelineRecord, Resources, TaskId,
    TaskRecord, TaskState, TaskTypeName, WorkerId, WorkerNode,
};
use crate::ports::{ReadyPipeline, StoreError, TaskCounts, TaskStore, Transition};

#[derive(Default)]
struct StoreState {
    /// BTreeMap なので id（= 作成）順
    tasks: BTreeMap<TaskId, TaskRecord>,
    pipelines: BTreeMap<PipelineKey, PipelineRecord>,
    history: Vec<HistoryEntry>,
    workers: HashMap<WorkerId, WorkerNode>,
}

impl StoreState {
    fn owned_row_mut(
        &mut self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<&mut TaskRecord>, StoreError> {
        let record = self
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        if record.is_owned_by(worker, now) {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    fn stage_is_done(
        &self,
        pipeline: &PipelineRecord,
        stage: &TaskTypeName,
    ) -> Result<Option<TaskId>, StoreError> {
        let Some(task_id) = pipeline.task_for(stage) else {
            return Ok(None);
        };
        let record = self.tasks.get(&task_id).ok_or_else(|| {
            StoreError::Inconsistent(format!(
                "pipeline {} references missing {} row {}",
                pipeline.key, stage, task_id
            ))
        })?;
        Ok((record.state == TaskState::Done).then_some(task_id))
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全タスク行（id 順）。テストとデモの最終レポート用
    pub async fn all_tasks(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        state.tasks.values().cloned().collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn register_pipeline(
        &self,
        key: PipelineKey,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.pipelines.contains_key(&key) {
            return Ok(false);
        }
        state
            .pipelines
            .insert(key.clone(), PipelineRecord::new(key, payload, now));
        Ok(true)
    }

    async fn get_pipeline(&self, key: &PipelineKey) -> Result<Option<PipelineRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.pipelines.get(key).cloned())
    }

    async fn pipelines_ready_for(
        &self,
        stage: &TaskTypeName,
        follows: &[TaskTypeName],
    ) -> Result<Vec<ReadyPipeline>, StoreError> {
        let state = self.state.lock().await;
        let mut ready = Vec::new();
        'pipelines: for pipeline in state.pipelines.values() {
            if pipeline.task_for(stage).is_some() {
                continue;
            }
            let mut predecessors = Vec::with_capacity(follows.len());
            for predecessor in follows {
                match state.stage_is_done(pipeline, predecessor)? {
                    Some(task_id) => predecessors.push(task_id),
                    None => continue 'pipelines,
                }
            }
            ready.push(ReadyPipeline {
                pipeline: pipeline.clone(),
                predecessors,
            });
        }
        Ok(ready)
    }

    async fn insert_task(
        &self,
        id: TaskId,
        mut new: NewTask,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&id) {
            return Err(StoreError::Inconsistent(format!("duplicate task id {id}")));
        }

        match new.pipeline.clone() {
            Some(key) => {
                let pipeline = state
                    .pipelines
                    .get(&key)
                    .ok_or_else(|| StoreError::UnknownPipeline(key.clone()))?;
                if let Some(existing) = pipeline.task_for(&new.task_type) {
                    return Ok(InsertOutcome::AlreadyExists(existing));
                }
                let mut predecessors = Vec::with_capacity(new.follows.len());
                for stage in &new.follows {
                    match state.stage_is_done(pipeline, stage)? {
                        Some(task_id) => predecessors.push(task_id),
                        None => {
                            return Err(StoreError::PredecessorsNotDone {
                                stage: new.task_type.clone(),
                                pipeline: key,
                            });
                        }
                    }
                }
                if new.depends_on.is_empty() {
                    new.depends_on = predecessors;
                }
                if let Some(pipeline) = state.pipelines.get_mut(&key) {
                    pipeline.stages.insert(new.task_type.clone(), id);
                }
            }
            None if !new.follows.is_empty() => {
                return Err(StoreError::PipelineRequired(new.task_type.clone()));
            }
            None => {}
        }

        state.tasks.insert(id, TaskRecord::from_new(id, new, now));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn list_claimable(
        &self,
        task_type: &TaskTypeName,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|r| &r.task_type == task_type && r.is_claimable(now))
            .cloned()
            .collect())
    }

    async fn try_claim(
        &self,
        id: TaskId,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        if !record.is_claimable(now) {
            return Ok(false);
        }
        record.claim(worker, lease_until, now);
        Ok(true)
    }

    async fn mark_running(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.owned_row_mut(id, worker, now)? {
            Some(record) => {
                record.start_running(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.owned_row_mut(id, worker, now)? {
            Some(record) => {
                record.renew(lease_until, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finalize(
        &self,
        id: TaskId,
        worker: WorkerId,
        transition: Transition,
        history: HistoryEntry,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.owned_row_mut(id, worker, now)? else {
            return Ok(false);
        };
        match transition {
            Transition::Done => record.mark_done(now),
            Transition::Requeue {
                failure_count,
                error,
            } => record.requeue(failure_count, error, now),
            Transition::Fail {
                failure_count,
                error,
            } => record.mark_failed(failure_count, error, now),
        }
        state.history.push(history);
        Ok(true)
    }

    async fn history(&self, id: TaskId) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.task_id == id)
            .cloned()
            .collect())
    }

    async fn counts_by_state(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for record in state.tasks.values() {
            match record.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Claimed => counts.claimed += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn failed_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|r| r.state == TaskState::Failed)
            .cloned()
            .collect())
    }

    async fn upsert_worker(&self, node: WorkerNode) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.workers.insert(node.id, node);
        Ok(())
    }

    async fn heartbeat(
        &self,
        id: WorkerId,
        committed: Resources,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&id) {
            Some(node) => {
                node.committed = committed;
                node.last_heartbeat = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn live_workers(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<WorkerNode>, StoreError> {
        let state = self.state.lock().await;
        let mut live: Vec<WorkerNode> = state
            .workers
            .values()
            .filter(|w| w.is_alive(now, timeout))
            .cloned()
            .collect();
        live.sort_by_key(|w| w.id);
        Ok(live)
    }

    async fn remove_worker(&self, id: WorkerId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.workers.remove(&id);
        Ok(())
    }
}
