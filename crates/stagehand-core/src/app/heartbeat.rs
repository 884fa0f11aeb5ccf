//! HeartbeatLoop - ワーカー行の生存通知
//!
//! Task leases are renewed by the bodies through `OwnershipProbe`, not here.
//! This loop only keeps the worker row (and its committed usage) fresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::engine::TaskEngine;

pub struct HeartbeatLoop {
    engine: Arc<TaskEngine>,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        let interval = engine.config().heartbeat_interval();
        Self { engine, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

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
            }

            match self.engine.heartbeat().await {
                Ok(()) => debug!(worker = %self.engine.worker_id(), "heartbeat"),
                Err(e) => error!(worker = %self.engine.worker_id(), error = %e, "heartbeat failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::EngineBuilder;
    use crate::config::EngineConfig;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{Clock, FixedClock, TaskStore};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn heartbeat_keeps_the_worker_live_and_recreates_its_row() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new());
        let config = EngineConfig {
            heartbeat_interval_ms: 10,
            ..EngineConfig::default()
        };
        let engine = Arc::new(
            EngineBuilder::new(store.clone())
                .with_clock(clock.clone())
                .with_config(config.clone())
                .build()
                .unwrap(),
        );
        engine.register_worker().await.unwrap();

        clock.advance(chrono::Duration::seconds(60));
        assert!(store.live_workers(clock.now(), config.heartbeat_timeout()).await.unwrap().is_empty());

        engine.heartbeat().await.unwrap();
        assert_eq!(store.live_workers(clock.now(), config.heartbeat_timeout()).await.unwrap().len(), 1);

        // row removed behind our back: the loop puts it back
        store.remove_worker(engine.worker_id()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(HeartbeatLoop::new(Arc::clone(&engine)).run(rx));
        let mut live = 0;
        for _ in 0..100 {
            live = store.live_workers(clock.now(), config.heartbeat_timeout()).await.unwrap().len();
            if live == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(live, 1);

        tx.send(true).unwrap();
        join.await.unwrap();
    }
}
