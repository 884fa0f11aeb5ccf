//! Stage names and stage descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::resources::Resources;

/// Name of a task type (stage), e.g. `"SDRTrees"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskTypeName(String);

impl TaskTypeName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskTypeName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Immutable descriptor of a stage, returned by `Stage::details`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDetails {
    pub name: TaskTypeName,

    /// Human-readable name for logs and status output.
    pub display_name: String,

    /// Max concurrently running instances on one worker. `0` = unlimited.
    pub max_per_worker: usize,

    /// Resources reserved on the worker for each running instance.
    pub cost: Resources,

    /// Failures after which the task becomes terminally `Failed`. `0` = unlimited.
    pub max_failures: u32,

    /// Predecessor stages. A task of this stage is only created for a
    /// pipeline once every predecessor's task for that pipeline is Done.
    pub follows: Vec<TaskTypeName>,

    /// Rows are only inserted through `AddTaskHandle`; no dependency poller
    /// runs for this stage.
    #[serde(default)]
    pub fed_externally: bool,
}

impl StageDetails {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name: TaskTypeName::new(name),
            max_per_worker: 0,
            cost: Resources::ZERO,
            max_failures: 0,
            follows: Vec::new(),
            fed_externally: false,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_max_per_worker(mut self, max: usize) -> Self {
        self.max_per_worker = max;
        self
    }

    pub fn with_cost(mut self, cost: Resources) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn following<I, S>(mut self, follows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.follows = follows.into_iter().map(|s| TaskTypeName::new(s)).collect();
        self
    }

    pub fn fed_externally(mut self) -> Self {
        self.fed_externally = true;
        self
    }

    /// Is the per-worker concurrency limit reached with `running` instances?
    pub fn at_capacity(&self, running: usize) -> bool {
        self.max_per_worker != 0 && running >= self.max_per_worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_every_field() {
        let details = StageDetails::new("SDRTrees")
            .with_display_name("Trees")
            .with_max_per_worker(2)
            .with_cost(Resources::new(1, 1, 8000))
            .with_max_failures(3)
            .following(["PreCommit2"]);

        assert_eq!(details.name.as_str(), "SDRTrees");
        assert_eq!(details.display_name, "Trees");
        assert_eq!(details.cost, Resources::new(1, 1, 8000));
        assert_eq!(details.follows, vec![TaskTypeName::new("PreCommit2")]);
        assert!(!details.at_capacity(1));
        assert!(details.at_capacity(2));
    }

    #[test]
    fn zero_max_per_worker_is_unlimited() {
        let details = StageDetails::new("x");
        assert!(!details.at_capacity(10_000));
    }
}
