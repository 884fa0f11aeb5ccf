//! OwnershipProbe - 実行中のタスク本体に渡す「まだ自分のものか？」
//!
//! Long-running bodies call `still_owned().await` at checkpoints. Each call
//! renews the lease; once the store says the lease is gone the probe latches
//! and every later call returns `false` without touching the store.
//! Returning early after a `false` is the body's job. The engine discards the
//! result of a body whose lease was lost either way.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::app::lease::LeaseManager;
use crate::domain::{TaskId, WorkerId};

#[derive(Clone)]
pub struct OwnershipProbe {
    task_id: TaskId,
    worker: WorkerId,
    leases: Arc<LeaseManager>,
    lost: Arc<AtomicBool>,
}

impl OwnershipProbe {
    pub(crate) fn new(task_id: TaskId, worker: WorkerId, leases: Arc<LeaseManager>) -> Self {
        Self {
            task_id,
            worker,
            leases,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// lease を延長し、まだ所有しているかを返す
    ///
    /// store エラーはこの呼び出しだけ `false`（確認できなかっただけで、
    /// 失ったとは観測していない）。
    pub async fn still_owned(&self) -> bool {
        if self.is_lost() {
            return false;
        }
        match self.leases.renew(self.task_id, self.worker).await {
            Ok(true) => true,
            Ok(false) => {
                self.lost.store(true, Ordering::SeqCst);
                warn!(task_id = %self.task_id, worker = %self.worker, "lease lost");
                false
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "lease renewal failed");
                false
            }
        }
    }

    /// 以前の `still_owned` が lease 喪失を観測したか
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for OwnershipProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipProbe")
            .field("task_id", &self.task_id)
            .field("worker", &self.worker)
            .field("lost", &self.is_lost())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Resources, TaskTypeName};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{Clock, FixedClock, TaskStore};
    use chrono::{Duration, TimeZone, Utc};
    use ulid::Ulid;

    #[tokio::test]
    async fn probe_latches_once_lease_is_lost() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new());
        let task_id = TaskId::from_ulid(Ulid::new());
        store
            .insert_task(
                task_id,
                NewTask::new(TaskTypeName::new("SDR"), Resources::ZERO),
                clock.now(),
            )
            .await
            .unwrap();
        let leases = Arc::new(LeaseManager::new(store, clock.clone(), Duration::seconds(30)));

        let (a, b) = (WorkerId::from_ulid(Ulid::new()), WorkerId::from_ulid(Ulid::new()));
        assert!(leases.claim(task_id, a).await.unwrap());
        let probe = OwnershipProbe::new(task_id, a, leases.clone());

        clock.advance(Duration::seconds(20));
        assert!(probe.still_owned().await);
        clock.advance(Duration::seconds(20));
        // renewed at +20s, so still owned at +40s
        assert!(probe.still_owned().await);

        clock.advance(Duration::seconds(31));
        assert!(leases.claim(task_id, b).await.unwrap());
        assert!(!probe.still_owned().await);
        assert!(probe.is_lost());

        // clones share the latch
        let clone = probe.clone();
        assert!(!clone.still_owned().await);
    }
}
