//! TaskStore port - 共有ストアが実装する正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスク行（状態・所有者・lease・失敗回数）
//! - パイプライン行（stage ごとのタスク ID）
//! - ワーカー行（容量・heartbeat）
//! - 履歴（attempt ごとの結果）
//!
//! # 設計原則
//! - 所有権の遷移（claim / renew / finalize）はすべて compare-and-swap
//! - finalize と履歴の追記は同一トランザクション内
//! - ワーカーはストアを介してのみ協調する（peer 間通信なし）

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    HistoryEntry, InsertOutcome, NewTask, PipelineKey, PipelineRecord, Resources, TaskId,
    TaskRecord, TaskTypeName, WorkerId, WorkerNode,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("unknown pipeline: {0}")]
    UnknownPipeline(PipelineKey),

    /// 前段の行がすべて Done になる前に後段の行が挿入されようとした
    #[error("{stage} for pipeline {pipeline}: predecessors not done")]
    PredecessorsNotDone {
        stage: TaskTypeName,
        pipeline: PipelineKey,
    },

    /// 前段を持つ stage は pipeline 付きでしか挿入できない
    #[error("{0} follows other stages and needs a pipeline key")]
    PipelineRequired(TaskTypeName),

    /// 一意・整合であるべき行がそうなっていない
    #[error("store inconsistency: {0}")]
    Inconsistent(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// `now + lease_duration` が表現できる時刻を超える
    #[error("lease expiry out of range")]
    LeaseOutOfRange,
}

/// Transition は `TaskStore::finalize` が適用する状態遷移
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// 終端（成功）
    Done,

    /// Pending に戻す。未完了の本体なら `error` は `None`
    Requeue {
        failure_count: u32,
        error: Option<String>,
    },

    /// 終端（失敗）
    Fail { failure_count: u32, error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.running + self.done + self.failed
    }

    /// どのワーカーも拾う・終わらせるものが残っていない
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.claimed == 0 && self.running == 0
    }
}

/// ReadyPipeline は stage の準備ができたパイプラインと Done の前段行
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyPipeline {
    pub pipeline: PipelineRecord,
    pub predecessors: Vec<TaskId>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    // ---- pipelines -------------------------------------------------------

    /// パイプラインインスタンスを登録。キーが既にあれば `false`（既存行はそのまま）
    async fn register_pipeline(
        &self,
        key: PipelineKey,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get_pipeline(&self, key: &PipelineKey) -> Result<Option<PipelineRecord>, StoreError>;

    /// `stage` の行がまだなく、`follows` の全 stage の行が Done のパイプライン
    async fn pipelines_ready_for(
        &self,
        stage: &TaskTypeName,
        follows: &[TaskTypeName],
    ) -> Result<Vec<ReadyPipeline>, StoreError>;

    // ---- tasks -----------------------------------------------------------

    /// タスク行を挿入
    ///
    /// - pipeline 付きなら (pipeline, task_type) で一意。2 回目は既存 id の `AlreadyExists`
    /// - `new.follows` が空でなければ、同じクリティカルセクションでその pipeline の
    ///   前段行がすべて Done であることを確認する（違えば `PredecessorsNotDone`）
    /// - `depends_on` が空なら前段行の id で埋める
    async fn insert_task(
        &self,
        id: TaskId,
        new: NewTask,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// `now` 時点で claimable な `task_type` の行（Pending か lease 切れ）、id 順
    async fn list_claimable(
        &self,
        task_type: &TaskTypeName,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// CAS: Pending/期限切れ -> `worker` の Claimed
    /// 他者が有効な lease を持つか終端なら `false`
    async fn try_claim(
        &self,
        id: TaskId,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Claimed -> Running（有効な所有者のみ）
    async fn mark_running(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// lease を延長（有効な所有者のみ）
    async fn renew_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `transition` を適用し `history` を追記（有効な所有者のみ）
    /// `false` は lease を失っていて何も書かれなかったこと
    async fn finalize(
        &self,
        id: TaskId,
        worker: WorkerId,
        transition: Transition,
        history: HistoryEntry,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn history(&self, id: TaskId) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn counts_by_state(&self) -> Result<TaskCounts, StoreError>;

    /// 終端失敗した行（運用者の診断用）
    async fn failed_tasks(&self) -> Result<Vec<TaskRecord>, StoreError>;

    // ---- workers ---------------------------------------------------------

    async fn upsert_worker(&self, node: WorkerNode) -> Result<(), StoreError>;

    /// heartbeat と使用量を更新。行がなければ `false`
    async fn heartbeat(
        &self,
        id: WorkerId,
        committed: Resources,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// 最後の heartbeat が `timeout` 以内のワーカー
    async fn live_workers(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<WorkerNode>, StoreError>;

    async fn remove_worker(&self, id: WorkerId) -> Result<(), StoreError>;
}
