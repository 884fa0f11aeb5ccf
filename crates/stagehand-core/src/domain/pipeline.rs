//! Pipeline instances: the real-world unit flowing through the stages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PipelineKey, TaskId};
use super::task_type::TaskTypeName;

/// One pipeline instance (e.g. one sector) and its per-stage task rows.
///
/// `stages` is what makes successor insertion idempotent: a stage appears at
/// most once per pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub key: PipelineKey,

    /// Opaque; copied into every task row created for this pipeline.
    pub payload: serde_json::Value,

    pub stages: BTreeMap<TaskTypeName, TaskId>,

    pub created_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn new(key: PipelineKey, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            key,
            payload,
            stages: BTreeMap::new(),
            created_at: now,
        }
    }

    pub fn task_for(&self, stage: &TaskTypeName) -> Option<TaskId> {
        self.stages.get(stage).copied()
    }
}
