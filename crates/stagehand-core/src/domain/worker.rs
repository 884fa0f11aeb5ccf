//! Worker node rows (one per engine process).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;
use super::resources::Resources;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: WorkerId,
    pub name: String,

    /// Declared capacity of the machine.
    pub capacity: Resources,

    /// Capacity currently reserved by running tasks.
    pub committed: Resources,

    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerNode {
    pub fn new(id: WorkerId, name: impl Into<String>, capacity: Resources, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            capacity,
            committed: Resources::ZERO,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// A worker is considered gone once it has been silent for `timeout`.
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat < timeout
    }
}
