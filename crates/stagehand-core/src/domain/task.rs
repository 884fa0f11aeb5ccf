//! Task record: one row of the shared tasks relation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PipelineKey, TaskId, WorkerId};
use super::resources::Resources;
use super::state::TaskState;
use super::task_type::TaskTypeName;

/// One task row.
///
/// Design:
/// - The store owns these rows; engines only ever hold copies.
/// - `owner` + `lease_expiry` are set together while `Claimed`/`Running`.
/// - `failure_count < max_failures` for every non-terminal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskTypeName,
    pub state: TaskState,

    pub owner: Option<WorkerId>,
    pub lease_expiry: Option<DateTime<Utc>>,

    pub failure_count: u32,
    pub last_error: Option<String>,

    /// Pipeline instance this row belongs to (usually one sector).
    pub pipeline: Option<PipelineKey>,

    /// Predecessor task rows that were Done when this row was inserted.
    pub depends_on: Vec<TaskId>,

    /// Cost snapshot taken from the stage descriptor at insertion.
    pub cost: Resources,

    /// Opaque to the engine.
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn from_new(id: TaskId, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: new.task_type,
            state: TaskState::Pending,
            owner: None,
            lease_expiry: None,
            failure_count: 0,
            last_error: None,
            pipeline: new.pipeline,
            depends_on: new.depends_on,
            cost: new.cost,
            payload: new.payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Has the lease run out at `now`? Rows without a lease are never expired.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expiry {
            Some(expiry) => expiry <= now,
            None => false,
        }
    }

    /// Is `worker` the owner with an unexpired lease at `now`?
    pub fn is_owned_by(&self, worker: WorkerId, now: DateTime<Utc>) -> bool {
        self.state.is_leased() && self.owner == Some(worker) && !self.lease_expired(now)
    }

    /// Can a worker claim this row at `now`?
    ///
    /// Pending rows without an owner, or leased rows whose lease has expired
    /// (the previous owner crashed or hung).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::Pending => self.owner.is_none(),
            TaskState::Claimed | TaskState::Running => self.lease_expired(now),
            TaskState::Done | TaskState::Failed => false,
        }
    }

    pub fn claim(&mut self, worker: WorkerId, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = TaskState::Claimed;
        self.owner = Some(worker);
        self.lease_expiry = Some(lease_until);
        self.updated_at = now;
    }

    pub fn start_running(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Running;
        self.updated_at = now;
    }

    pub fn renew(&mut self, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.lease_expiry = Some(lease_until);
        self.updated_at = now;
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Done;
        self.clear_lease();
        self.updated_at = now;
    }

    /// Back to Pending for another attempt.
    pub fn requeue(&mut self, failure_count: u32, error: Option<String>, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.failure_count = failure_count;
        if error.is_some() {
            self.last_error = error;
        }
        self.clear_lease();
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, failure_count: u32, error: String, now: DateTime<Utc>) {
        self.state = TaskState::Failed;
        self.failure_count = failure_count;
        self.last_error = Some(error);
        self.clear_lease();
        self.updated_at = now;
    }

    fn clear_lease(&mut self) {
        self.owner = None;
        self.lease_expiry = None;
    }
}

/// Insert request for a task row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: TaskTypeName,
    pub pipeline: Option<PipelineKey>,
    pub depends_on: Vec<TaskId>,
    pub cost: Resources,
    pub payload: serde_json::Value,
    /// Predecessor stage names. A pipeline-keyed insert needs all of them Done.
    pub follows: Vec<TaskTypeName>,
}

impl NewTask {
    pub fn new(task_type: TaskTypeName, cost: Resources) -> Self {
        Self {
            task_type,
            pipeline: None,
            depends_on: Vec::new(),
            cost,
            payload: serde_json::Value::Null,
            follows: Vec::new(),
        }
    }

    pub fn for_pipeline(mut self, key: PipelineKey) -> Self {
        self.pipeline = Some(key);
        self
    }

    pub fn depending_on(mut self, ids: Vec<TaskId>) -> Self {
        self.depends_on = ids;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn following(mut self, follows: Vec<TaskTypeName>) -> Self {
        self.follows = follows;
        self
    }
}

/// Result of an insert. A uniqueness hit on (pipeline, stage) is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(TaskId),
    AlreadyExists(TaskId),
}

impl InsertOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::AlreadyExists(id) => *id,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}
