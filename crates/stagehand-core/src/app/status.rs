//! Status - 運用者向けの状態ビュー
//!
//! 詰まり理由（Failed タスクの last_error / failure_count）と
//! 生存ワーカーをまとめて返す。

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::{PipelineKey, TaskId, TaskTypeName, WorkerNode};
use crate::ports::{StoreError, TaskCounts, TaskStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub stage: TaskTypeName,
    pub pipeline: Option<PipelineKey>,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub at: DateTime<Utc>,
    pub counts: TaskCounts,
    pub failed: Vec<FailedTask>,
    pub live_workers: Vec<WorkerNode>,
}

impl StatusReport {
    pub async fn collect(
        store: &dyn TaskStore,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let counts = store.counts_by_state().await?;
        let failed = store
            .failed_tasks()
            .await?
            .into_iter()
            .map(|r| FailedTask {
                task_id: r.id,
                stage: r.task_type,
                pipeline: r.pipeline,
                failure_count: r.failure_count,
                last_error: r.last_error,
            })
            .collect();
        let live_workers = store.live_workers(now, heartbeat_timeout).await?;
        Ok(Self {
            at: now,
            counts,
            failed,
            live_workers,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "tasks: {} total, {} pending, {} claimed, {} running, {} done, {} failed",
            c.total(),
            c.pending,
            c.claimed,
            c.running,
            c.done,
            c.failed
        )?;
        writeln!(f, "live workers: {}", self.live_workers.len())?;
        for w in &self.live_workers {
            writeln!(f, "  {} ({}) committed {} of {}", w.name, w.id, w.committed, w.capacity)?;
        }
        for t in &self.failed {
            writeln!(
                f,
                "  FAILED {} {} pipeline={} failures={} error={}",
                t.stage,
                t.task_id,
                t.pipeline.as_ref().map(|k| k.as_str()).unwrap_or("-"),
                t.failure_count,
                t.last_error.as_deref().unwrap_or("-"),
            )?;
        }
        Ok(())
    }
}
