//! EngineGroup - claim ループ・poller・heartbeat の起動と停止

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::engine::{EngineError, TaskEngine};
use super::heartbeat::HeartbeatLoop;

/// EngineGroup は 1 つの engine がバックグラウンドで回すものの束
///
/// - claim ループ、stage ごとの dependency poller、heartbeat
/// - `shutdown_tx` を send するとすべて止まる
/// - `shutdown_and_join()` は実行中のタスク本体の終了まで待つ
pub struct EngineGroup {
    engine: Arc<TaskEngine>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl EngineGroup {
    /// ワーカー行を登録してループを spawn
    pub async fn start(engine: Arc<TaskEngine>) -> Result<Self, EngineError> {
        engine.register_worker().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::new();

        let interval = engine.config().dependency_poll_interval();
        for poller in engine.pollers() {
            let poller = Arc::clone(poller);
            joins.push(tokio::spawn(poller.run(interval, shutdown_rx.clone())));
        }
        joins.push(tokio::spawn(
            HeartbeatLoop::new(Arc::clone(&engine)).run(shutdown_rx.clone()),
        ));
        joins.push(tokio::spawn(Arc::clone(&engine).run(shutdown_rx)));

        info!(worker = %engine.worker_id(), loops = joins.len(), "engine group started");
        Ok(Self {
            engine,
            shutdown_tx,
            joins,
        })
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// 新規の claim を止める。実行中の本体はキャンセルしない
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::EngineBuilder;
    use crate::config::EngineConfig;
    use crate::domain::{PipelineKey, StageDetails, TaskError};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{SystemClock, TaskStore, Clock};
    use crate::stage::{OwnershipProbe, Stage, TaskContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Quick(&'static str, &'static [&'static str]);

    #[async_trait]
    impl Stage for Quick {
        fn details(&self) -> StageDetails {
            StageDetails::new(self.0).following(self.1.iter().copied())
        }

        async fn execute(&self, _task: TaskContext, probe: OwnershipProbe) -> Result<bool, TaskError> {
            Ok(probe.still_owned().await)
        }
    }

    struct NeverFinished(Arc<AtomicU32>);

    #[async_trait]
    impl Stage for NeverFinished {
        fn details(&self) -> StageDetails {
            StageDetails::new("WaitSeed")
        }

        async fn execute(&self, _task: TaskContext, _probe: OwnershipProbe) -> Result<bool, TaskError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[tokio::test]
    async fn unfinished_body_is_retried_at_poll_interval() {
        let store = Arc::new(InMemoryTaskStore::new());
        store
            .register_pipeline(PipelineKey::new("s1"), serde_json::Value::Null, SystemClock.now())
            .await
            .unwrap();
        let config = EngineConfig {
            poll_interval_ms: 200,
            dependency_poll_interval_ms: 5,
            ..EngineConfig::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let engine = EngineBuilder::new(store.clone())
            .with_config(config)
            .register(NeverFinished(calls.clone()))
            .unwrap()
            .build()
            .unwrap();
        let group = EngineGroup::start(Arc::new(engine)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        group.shutdown_and_join().await;

        let n = calls.load(Ordering::SeqCst);
        assert!((1..=5).contains(&n), "body ran {n} times in 500ms");
        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn group_drives_a_chain_to_completion_and_cleans_up() {
        let store = Arc::new(InMemoryTaskStore::new());
        for n in 0..3 {
            store
                .register_pipeline(PipelineKey::new(format!("s{n}")), serde_json::Value::Null, SystemClock.now())
                .await
                .unwrap();
        }
        let config = EngineConfig {
            poll_interval_ms: 5,
            dependency_poll_interval_ms: 5,
            heartbeat_interval_ms: 20,
            ..EngineConfig::default()
        };
        let engine = EngineBuilder::new(store.clone())
            .with_config(config)
            .register(Quick("SDR", &[]))
            .unwrap()
            .register(Quick("SDRTrees", &["SDR"]))
            .unwrap()
            .build()
            .unwrap();
        let group = EngineGroup::start(Arc::new(engine)).await.unwrap();
        assert_eq!(store.live_workers(SystemClock.now(), chrono::Duration::seconds(30)).await.unwrap().len(), 1);

        let mut done = 0;
        for _ in 0..500 {
            done = store.counts_by_state().await.unwrap().done;
            if done == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done, 6);

        group.shutdown_and_join().await;
        assert!(store.live_workers(SystemClock.now(), chrono::Duration::seconds(30)).await.unwrap().is_empty());
    }
}
