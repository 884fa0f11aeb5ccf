//! TaskEngine - 1 ワーカー分のスケジューリングループ
//!
//! # フロー
//! 1. discover: 容量に収まる claimable 行を id 順で列挙
//! 2. claim: stage の can_accept → ledger 確保 → lease CAS
//! 3. execute: Running にして本体を spawn（OwnershipProbe 付き）
//! 4. finalize: Done / Continued / 失敗（FailureTracker）を owner ガード付きで書く
//!
//! # 原則
//! - 正本は store。engine が持つのは自分の ledger と実行数だけ
//! - ローカル状態の Mutex は await を跨がない
//! - タスク単位の失敗で loop は止まらない

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::backoff::Backoff;
use super::failure::{FailureDecision, FailureTracker};
use super::lease::LeaseManager;
use super::ledger::ResourceLedger;
use super::poller::DependencyPoller;
use crate::config::EngineConfig;
use crate::domain::{
    AttemptResult, HistoryEntry, Resources, TaskError, TaskId, TaskRecord, TaskTypeName, WorkerId,
    WorkerNode,
};
use crate::ports::{Clock, StoreError, TaskStore, Transition};
use crate::stage::{OwnershipProbe, RegisteredStage, SchedulerView, StageGraph, StageRegistry, TaskContext};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown stage: {0}")]
    UnknownStage(TaskTypeName),
}

/// ExecutionOutcome は 1 回の実行がこのワーカーから見てどう終わったか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Done,
    /// 本体が `Ok(false)` を返した。Pending に戻し、失敗は数えない
    Continued,
    Requeued { failure_count: u32 },
    Failed { failure_count: u32 },
    /// 結果を書く前に lease を失った。結果は破棄
    LeaseLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub stage: TaskTypeName,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug)]
struct LocalState {
    ledger: ResourceLedger,
    running: BTreeMap<TaskTypeName, usize>,
}

fn lock(local: &Mutex<LocalState>) -> MutexGuard<'_, LocalState> {
    // bodies never run under this lock, so a poisoned guard still holds
    // consistent bookkeeping
    local.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reservation は claim 済みタスク 1 件分の容量と実行枠
///
/// drop で返却されるので、どの経路（競合負け・store エラー・finalize）でも
/// 解放はちょうど 1 回。
struct Reservation {
    local: Arc<Mutex<LocalState>>,
    stage: TaskTypeName,
    cost: Resources,
    freed: Arc<Notify>,
    /// false: 解放しても claim ループを起こさない
    wake: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        {
            let mut local = lock(&self.local);
            local.ledger.release(&self.cost);
            if let Some(n) = local.running.get_mut(&self.stage) {
                *n = n.saturating_sub(1);
            }
        }
        if self.wake {
            self.freed.notify_one();
        }
    }
}

/// ClaimedTask は lease を取ったがまだ実行していないタスク
pub struct ClaimedTask {
    record: TaskRecord,
    stage: RegisteredStage,
    reservation: Reservation,
}

impl ClaimedTask {
    pub fn task_id(&self) -> TaskId {
        self.record.id
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }
}

impl std::fmt::Debug for ClaimedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedTask")
            .field("task_id", &self.record.id)
            .field("stage", &self.reservation.stage)
            .field("cost", &self.reservation.cost)
            .finish()
    }
}

pub struct TaskEngine {
    worker: WorkerId,
    config: EngineConfig,
    registry: StageRegistry,
    graph: StageGraph,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    leases: Arc<LeaseManager>,
    failures: FailureTracker,
    pollers: BTreeMap<TaskTypeName, Arc<DependencyPoller>>,
    local: Arc<Mutex<LocalState>>,
    freed: Arc<Notify>,
}

impl TaskEngine {
    pub(crate) fn new(
        worker: WorkerId,
        config: EngineConfig,
        registry: StageRegistry,
        graph: StageGraph,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        pollers: BTreeMap<TaskTypeName, Arc<DependencyPoller>>,
    ) -> Self {
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.lease_duration(),
        ));
        let local = LocalState {
            ledger: ResourceLedger::new(config.capacity),
            running: BTreeMap::new(),
        };
        Self {
            worker,
            failures: FailureTracker::new(Arc::clone(&store)),
            config,
            registry,
            graph,
            store,
            clock,
            leases,
            pollers,
            local: Arc::new(Mutex::new(local)),
            freed: Arc::new(Notify::new()),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn stage_names(&self) -> Vec<TaskTypeName> {
        self.registry.registered_names()
    }

    pub fn pollers(&self) -> impl Iterator<Item = &Arc<DependencyPoller>> {
        self.pollers.values()
    }

    pub fn committed(&self) -> Resources {
        lock(&self.local).ledger.committed()
    }

    pub fn available(&self) -> Resources {
        lock(&self.local).ledger.available()
    }

    pub fn running_of(&self, stage: &TaskTypeName) -> usize {
        lock(&self.local).running.get(stage).copied().unwrap_or(0)
    }

    fn stage(&self, name: &TaskTypeName) -> Result<&RegisteredStage, EngineError> {
        self.registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownStage(name.clone()))
    }

    // ---- worker row ------------------------------------------------------

    pub async fn register_worker(&self) -> Result<(), EngineError> {
        let node = WorkerNode::new(
            self.worker,
            self.config.worker_name.clone(),
            self.config.capacity,
            self.clock.now(),
        );
        self.store.upsert_worker(node).await?;
        info!(worker = %self.worker, name = %self.config.worker_name, capacity = %self.config.capacity, "worker registered");
        Ok(())
    }

    /// ワーカー行を更新。消えていたら作り直す
    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        let committed = self.committed();
        if !self
            .store
            .heartbeat(self.worker, committed, self.clock.now())
            .await?
        {
            warn!(worker = %self.worker, "worker row missing, registering again");
            self.register_worker().await?;
        }
        Ok(())
    }

    pub async fn deregister_worker(&self) -> Result<(), EngineError> {
        self.store.remove_worker(self.worker).await?;
        info!(worker = %self.worker, "worker deregistered");
        Ok(())
    }

    // ---- dependency pollers ------------------------------------------------

    /// 全 poller を前段から順に 1 回ずつ回す。挿入した行数を返す
    pub async fn poll_dependencies(&self) -> Result<usize, EngineError> {
        let order = self.graph.topological_order().unwrap_or_default();
        let mut inserted = 0;
        for stage in &order {
            if let Some(poller) = self.pollers.get(stage) {
                inserted += poller.poll_once().await?;
            }
        }
        Ok(inserted)
    }

    fn wake_dependents(&self, stage: &TaskTypeName) {
        for dependent in self.graph.dependents_of(stage) {
            if let Some(poller) = self.pollers.get(&dependent) {
                poller.wake();
            }
        }
    }

    // ---- discover / claim / execute ---------------------------------------

    /// いま容量に収まる `stage` の claimable タスク（古い順）
    /// per-worker 上限に達している間は空
    pub async fn discover(&self, stage: &TaskTypeName) -> Result<Vec<TaskId>, EngineError> {
        let details = &self.stage(stage)?.details;
        if details.at_capacity(self.running_of(stage)) {
            return Ok(Vec::new());
        }
        let rows = self.store.list_claimable(stage, self.clock.now()).await?;
        let local = lock(&self.local);
        Ok(rows
            .into_iter()
            .filter(|r| local.ledger.fits(&r.cost))
            .map(|r| r.id)
            .collect())
    }

    fn view(&self) -> SchedulerView {
        let local = lock(&self.local);
        SchedulerView::new(
            self.worker,
            local.ledger.capacity(),
            local.ledger.available(),
            local.running.clone(),
            self.clock.now(),
            Arc::clone(&self.store),
        )
    }

    fn reserve(&self, stage: &RegisteredStage, cost: Resources) -> Option<Reservation> {
        let mut local = lock(&self.local);
        let running = local.running.get(stage.name()).copied().unwrap_or(0);
        if stage.details.at_capacity(running) || !local.ledger.reserve(&cost) {
            return None;
        }
        *local.running.entry(stage.name().clone()).or_default() += 1;
        Some(Reservation {
            local: Arc::clone(&self.local),
            stage: stage.name().clone(),
            cost,
            freed: Arc::clone(&self.freed),
            wake: true,
        })
    }

    /// stage に `candidates` から 1 件選ばせ、容量を確保して lease を取る
    /// 辞退・容量不足・競合負けはどれも `None`
    pub async fn claim(
        &self,
        stage: &TaskTypeName,
        candidates: &[TaskId],
    ) -> Result<Option<ClaimedTask>, EngineError> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let registered = self.stage(stage)?.clone();

        let chosen = match registered.stage.can_accept(candidates, &self.view()).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(stage = %stage, candidates = candidates.len(), "admission declined");
                return Ok(None);
            }
            Err(e) => {
                warn!(stage = %stage, error = %e, "admission callback failed");
                return Ok(None);
            }
        };
        if !candidates.contains(&chosen) {
            warn!(stage = %stage, task_id = %chosen, "admission picked a task outside the candidate list");
            return Ok(None);
        }

        let Some(record) = self.store.get_task(chosen).await? else {
            return Ok(None);
        };
        let Some(reservation) = self.reserve(&registered, record.cost) else {
            debug!(stage = %stage, task_id = %chosen, "not enough capacity, retry later");
            return Ok(None);
        };

        if !self.leases.claim(chosen, self.worker).await? {
            return Ok(None);
        }
        let Some(record) = self.store.get_task(chosen).await? else {
            return Ok(None);
        };
        debug!(stage = %stage, task_id = %chosen, worker = %self.worker, "task claimed");
        Ok(Some(ClaimedTask {
            record,
            stage: registered,
            reservation,
        }))
    }

    /// claim 済みタスクを最後まで実行して結果を書く
    pub async fn execute(&self, claimed: ClaimedTask) -> Result<ExecutionReport, EngineError> {
        let ClaimedTask {
            record,
            stage,
            mut reservation,
        } = claimed;
        let task_id = record.id;
        let stage_name = stage.name().clone();
        let report = |outcome| ExecutionReport {
            task_id,
            stage: stage_name.clone(),
            outcome,
        };

        if !self.leases.start(task_id, self.worker).await? {
            return Ok(report(ExecutionOutcome::LeaseLost));
        }
        let started_at = self.clock.now();
        let span = info_span!("task", task_id = %task_id, stage = %stage_name, worker = %self.worker);
        span.in_scope(|| debug!(attempt = record.failure_count + 1, "task started"));

        let probe = OwnershipProbe::new(task_id, self.worker, Arc::clone(&self.leases));
        let body = Arc::clone(&stage.stage);
        let ctx = TaskContext::new(record.clone());
        let body_probe = probe.clone();
        let handle = tokio::spawn(
            async move { body.execute(ctx, body_probe).await }.instrument(span.clone()),
        );
        let result = match handle.await {
            Ok(result) => result,
            Err(join) => Err(TaskError::transient(join_failure(join))),
        };

        let outcome = if probe.is_lost() {
            ExecutionOutcome::LeaseLost
        } else {
            self.finalize(&record, &stage, result, started_at)
                .instrument(span)
                .await?
        };
        // a row this worker just put back to Pending waits for the next
        // round; waking now would claim it again immediately
        reservation.wake = !matches!(
            outcome,
            ExecutionOutcome::Continued | ExecutionOutcome::Requeued { .. }
        );
        drop(reservation);

        if outcome == ExecutionOutcome::Done {
            self.wake_dependents(&stage_name);
        }
        Ok(report(outcome))
    }

    async fn finalize(
        &self,
        record: &TaskRecord,
        stage: &RegisteredStage,
        result: Result<bool, TaskError>,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let now = self.clock.now();
        let entry = |result, error| HistoryEntry {
            task_id: record.id,
            task_type: record.task_type.clone(),
            worker: self.worker,
            started_at,
            ended_at: now,
            result,
            error,
        };

        let outcome = match result {
            Ok(true) => {
                let applied = self
                    .store
                    .finalize(record.id, self.worker, Transition::Done, entry(AttemptResult::Done, None), now)
                    .await?;
                if applied {
                    info!("task done");
                    ExecutionOutcome::Done
                } else {
                    ExecutionOutcome::LeaseLost
                }
            }
            Ok(false) => {
                let transition = Transition::Requeue {
                    failure_count: record.failure_count,
                    error: None,
                };
                let applied = self
                    .store
                    .finalize(record.id, self.worker, transition, entry(AttemptResult::Continued, None), now)
                    .await?;
                if applied {
                    debug!("task not finished, rescheduled");
                    ExecutionOutcome::Continued
                } else {
                    ExecutionOutcome::LeaseLost
                }
            }
            Err(e) => {
                match self
                    .failures
                    .record_failure(record, stage.details.max_failures, self.worker, &e, started_at, now)
                    .await?
                {
                    Some(FailureDecision::Requeue { failure_count }) => {
                        ExecutionOutcome::Requeued { failure_count }
                    }
                    Some(FailureDecision::Fail { failure_count }) => {
                        ExecutionOutcome::Failed { failure_count }
                    }
                    None => ExecutionOutcome::LeaseLost,
                }
            }
        };
        if outcome == ExecutionOutcome::LeaseLost {
            warn!("lease lost before finalize, result discarded");
        }
        Ok(outcome)
    }

    /// `stage` の 1 件について discover + claim + execute をその場で行う
    pub async fn run_next(&self, stage: &TaskTypeName) -> Result<Option<ExecutionReport>, EngineError> {
        let candidates = self.discover(stage).await?;
        match self.claim(stage, &candidates).await? {
            Some(claimed) => Ok(Some(self.execute(claimed).await?)),
            None => Ok(None),
        }
    }

    /// 全 stage を 1 巡するスケジューリング
    ///
    /// 収まるだけ claim して `in_flight` に spawn し、claim した件数を返す。
    pub async fn schedule_round(
        self: &Arc<Self>,
        in_flight: &mut JoinSet<Result<ExecutionReport, EngineError>>,
    ) -> Result<usize, EngineError> {
        let mut claimed_total = 0;
        for stage in self.registry.registered_names() {
            // each candidate is tried at most once per round, so a body that
            // finishes instantly cannot keep this loop spinning
            let mut remaining = self.discover(&stage).await?;
            while !remaining.is_empty() {
                let Some(claimed) = self.claim(&stage, &remaining).await? else {
                    break;
                };
                let task_id = claimed.task_id();
                remaining.retain(|id| *id != task_id);
                claimed_total += 1;
                let engine = Arc::clone(self);
                in_flight.spawn(async move { engine.execute(claimed).await });
            }
        }
        Ok(claimed_total)
    }

    /// claim ループ。shutdown 後、実行中の本体が終わってから返る
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker, stages = self.registry.len(), "engine started");
        let mut in_flight = JoinSet::new();
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.schedule_round(&mut in_flight).await {
                Ok(0) => backoff.next_delay(),
                Ok(claimed) => {
                    debug!(claimed, "scheduling round");
                    backoff.reset();
                    self.config.poll_interval()
                }
                Err(e) => {
                    error!(error = %e, "scheduling round failed");
                    backoff.next_delay()
                }
            };

            while let Some(joined) = in_flight.try_join_next() {
                log_joined(joined);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
                _ = self.freed.notified() => {}
            }
        }

        info!(worker = %self.worker, in_flight = in_flight.len(), "engine stopping, waiting for running tasks");
        while let Some(joined) = in_flight.join_next().await {
            log_joined(joined);
        }
        if let Err(e) = self.deregister_worker().await {
            error!(error = %e, "failed to remove worker row");
        }
        info!(worker = %self.worker, "engine stopped");
    }
}

fn log_joined(joined: Result<Result<ExecutionReport, EngineError>, JoinError>) {
    match joined {
        Ok(Ok(report)) => debug!(task_id = %report.task_id, stage = %report.stage, outcome = ?report.outcome, "execution finished"),
        Ok(Err(e)) => error!(error = %e, "execution failed to record its result"),
        Err(e) => error!(error = %e, "execution task aborted"),
    }
}

/// panic した本体は通常の（数えられる）失敗として扱う
fn join_failure(join: JoinError) -> String {
    if !join.is_panic() {
        return "task body was cancelled".to_string();
    }
    let panic = join.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("task body panicked: {message}")
}
