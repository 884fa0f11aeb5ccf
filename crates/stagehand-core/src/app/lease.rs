//! LeaseManager - タスク所有権の取得・延長・確認
//!
//! # 原則
//! - 所有権は store 上の CAS でのみ移る
//! - 期限切れの lease は discover 時に遅延検出される（reaper ループなし）
//! - 時刻はすべて `Clock` から取る

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::domain::{TaskId, WorkerId};
use crate::ports::{Clock, StoreError, TaskStore};

pub struct LeaseManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            store,
            clock,
            lease_duration,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        now.checked_add_signed(self.lease_duration)
            .ok_or(StoreError::LeaseOutOfRange)
    }

    /// `task_id` の所有権を取る
    /// `false` は他のワーカーが有効な lease を持っているか、終端状態
    pub async fn claim(&self, task_id: TaskId, worker: WorkerId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let won = self
            .store
            .try_claim(task_id, worker, self.expiry(now)?, now)
            .await?;
        if !won {
            debug!(task_id = %task_id, worker = %worker, "claim lost");
        }
        Ok(won)
    }

    /// 現在の lease のまま Claimed -> Running
    pub async fn start(&self, task_id: TaskId, worker: WorkerId) -> Result<bool, StoreError> {
        self.store
            .mark_running(task_id, worker, self.clock.now())
            .await
    }

    /// 期限を `now + lease_duration` に延ばす
    /// 期限切れ・奪われた後は `false`。失った lease は復活しない
    pub async fn renew(&self, task_id: TaskId, worker: WorkerId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.store
            .renew_lease(task_id, worker, self.expiry(now)?, now)
            .await
    }

    pub async fn is_still_owned(&self, task_id: TaskId, worker: WorkerId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_task(task_id)
            .await?
            .is_some_and(|record| record.is_owned_by(worker, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Resources, TaskTypeName};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    struct Fixture {
        clock: Arc<FixedClock>,
        leases: LeaseManager,
        task_id: TaskId,
    }

    async fn fixture() -> Fixture {
        fixture_with(Duration::seconds(30)).await
    }

    async fn fixture_with(lease: Duration) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new());
        let task_id = TaskId::from_ulid(Ulid::new());
        store
            .insert_task(
                task_id,
                NewTask::new(TaskTypeName::new("PreCommit1"), Resources::ZERO),
                clock.now(),
            )
            .await
            .unwrap();
        let leases = LeaseManager::new(store, clock.clone(), lease);
        Fixture {
            clock,
            leases,
            task_id,
        }
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn second_claimer_loses_while_lease_is_live() {
        let f = fixture().await;
        let (a, b) = (worker(), worker());

        assert!(f.leases.claim(f.task_id, a).await.unwrap());
        assert!(!f.leases.claim(f.task_id, b).await.unwrap());
        assert!(f.leases.is_still_owned(f.task_id, a).await.unwrap());
        assert!(!f.leases.is_still_owned(f.task_id, b).await.unwrap());
    }

    #[tokio::test]
    async fn renew_keeps_the_lease_alive() {
        let f = fixture().await;
        let a = worker();
        f.leases.claim(f.task_id, a).await.unwrap();

        for _ in 0..5 {
            f.clock.advance(Duration::seconds(20));
            assert!(f.leases.renew(f.task_id, a).await.unwrap());
        }
        assert!(f.leases.is_still_owned(f.task_id, a).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_moves_to_the_next_claimer() {
        let f = fixture().await;
        let (a, b) = (worker(), worker());
        f.leases.claim(f.task_id, a).await.unwrap();
        assert!(f.leases.start(f.task_id, a).await.unwrap());

        f.clock.advance(Duration::seconds(30));
        assert!(!f.leases.is_still_owned(f.task_id, a).await.unwrap());
        assert!(!f.leases.renew(f.task_id, a).await.unwrap());

        assert!(f.leases.claim(f.task_id, b).await.unwrap());
        assert!(f.leases.is_still_owned(f.task_id, b).await.unwrap());
        // the crashed owner stays out even after b's claim
        assert!(!f.leases.renew(f.task_id, a).await.unwrap());
    }

    #[tokio::test]
    async fn unrepresentable_expiry_is_an_error() {
        let f = fixture_with(Duration::days(100_000_000_000)).await;
        let a = worker();

        let err = f.leases.claim(f.task_id, a).await.unwrap_err();
        assert_eq!(err, StoreError::LeaseOutOfRange);
        assert!(!f.leases.is_still_owned(f.task_id, a).await.unwrap());
    }
}
