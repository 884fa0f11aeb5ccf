//! DependencyPoller - 前段が Done になったパイプラインに次段の行を挿入
//!
//! # 原則
//! - pull 型: interval ごとに store を見る
//! - engine が Done を書いた直後は `Notify` で即座に起こされる
//! - 挿入の一意性は store が (pipeline, stage) で保証する
//!   → 複数ワーカーの poller が同時に動いても 1 行だけ

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::domain::{InsertOutcome, NewTask, Resources, StageDetails, TaskTypeName};
use crate::ports::{Clock, IdGenerator, StoreError, TaskStore};

pub struct DependencyPoller {
    stage: TaskTypeName,
    follows: Vec<TaskTypeName>,
    cost: Resources,
    store: Arc<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    wake: Notify,
}

impl DependencyPoller {
    pub fn new(
        details: &StageDetails,
        store: Arc<dyn TaskStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stage: details.name.clone(),
            follows: details.follows.clone(),
            cost: details.cost,
            store,
            ids,
            clock,
            wake: Notify::new(),
        }
    }

    pub fn stage(&self) -> &TaskTypeName {
        &self.stage
    }

    /// 実行中のループに前倒しの 1 回を頼む
    /// 待機中でなければ次の待機まで保持される
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// 1 回分: ready になった全パイプラインに行を挿入
    /// この呼び出しで挿入した行数を返す
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let ready = self
            .store
            .pipelines_ready_for(&self.stage, &self.follows)
            .await?;

        let mut inserted = 0;
        for candidate in ready {
            let key = candidate.pipeline.key.clone();
            let new = NewTask::new(self.stage.clone(), self.cost)
                .for_pipeline(key.clone())
                .following(self.follows.clone())
                .depending_on(candidate.predecessors)
                .with_payload(candidate.pipeline.payload);

            match self
                .store
                .insert_task(self.ids.generate_task_id(), new, self.clock.now())
                .await?
            {
                InsertOutcome::Inserted(task_id) => {
                    inserted += 1;
                    info!(stage = %self.stage, pipeline = %key, task_id = %task_id, "task inserted");
                }
                InsertOutcome::AlreadyExists(task_id) => {
                    debug!(stage = %self.stage, pipeline = %key, task_id = %task_id, "already inserted elsewhere");
                }
            }
        }
        Ok(inserted)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(stage = %self.stage, "dependency poller started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.poll_once().await {
                error!(stage = %self.stage, error = %e, "dependency poll failed");
            }
        }
        debug!(stage = %self.stage, "dependency poller stopped");
    }
}
