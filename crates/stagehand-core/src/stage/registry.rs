//! StageRegistry - Stage の登録と管理
//!
//! # 内部実装
//! - `register(stage)` で `details()` を一度だけ読み、名前で登録
//! - BTreeMap<TaskTypeName, RegisteredStage> で管理（名前順で列挙できる）
//! - `validate()` で follows の未知参照と循環を検出

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::graph::StageGraph;
use super::interface::Stage;
use crate::domain::{StageDetails, TaskTypeName};

/// RegisteredStage は登録時に取得した記述子付きの stage
#[derive(Clone)]
pub struct RegisteredStage {
    pub stage: Arc<dyn Stage>,
    pub details: StageDetails,
}

impl RegisteredStage {
    pub fn name(&self) -> &TaskTypeName {
        &self.details.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("stage '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("stage '{stage}' follows unknown stage '{predecessor}'")]
    UnknownPredecessor { stage: String, predecessor: String },

    #[error("stage dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: BTreeMap<TaskTypeName, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Stage>(&mut self, stage: S) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(stage))
    }

    pub fn register_arc(&mut self, stage: Arc<dyn Stage>) -> Result<(), RegistryError> {
        let details = stage.details();
        if self.stages.contains_key(&details.name) {
            return Err(RegistryError::AlreadyRegistered(details.name.to_string()));
        }
        self.stages
            .insert(details.name.clone(), RegisteredStage { stage, details });
        Ok(())
    }

    pub fn get(&self, name: &TaskTypeName) -> Option<&RegisteredStage> {
        self.stages.get(name)
    }

    pub fn registered_names(&self) -> Vec<TaskTypeName> {
        self.stages.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredStage> {
        self.stages.values()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// stage グラフを組み立てる。未知の前段と循環は拒否
    pub fn validate(&self) -> Result<StageGraph, RegistryError> {
        let mut graph = StageGraph::new();
        for registered in self.stages.values() {
            graph.add_stage(registered.details.name.clone(), &registered.details.follows);
        }

        if let Some((stage, predecessor)) = graph.unknown_predecessors().into_iter().next() {
            return Err(RegistryError::UnknownPredecessor {
                stage: stage.to_string(),
                predecessor: predecessor.to_string(),
            });
        }
        if let Some(cycle) = graph.detect_cycle() {
            return Err(RegistryError::Cycle(
                cycle.iter().map(|s| s.to_string()).collect(),
            ));
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskError;
    use crate::stage::{OwnershipProbe, TaskContext};
    use async_trait::async_trait;

    struct Named(StageDetails);

    #[async_trait]
    impl Stage for Named {
        fn details(&self) -> StageDetails {
            self.0.clone()
        }

        async fn execute(&self, _task: TaskContext, _probe: OwnershipProbe) -> Result<bool, TaskError> {
            Ok(true)
        }
    }

    fn stage(name: &str, follows: &[&str]) -> Named {
        Named(StageDetails::new(name).following(follows.iter().copied()))
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = StageRegistry::new();
        registry.register(stage("SDR", &[])).unwrap();

        let got = registry.get(&TaskTypeName::new("SDR")).unwrap();
        assert_eq!(got.name().as_str(), "SDR");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_double_registration() {
        let mut registry = StageRegistry::new();
        registry.register(stage("SDR", &[])).unwrap();
        let result = registry.register(stage("SDR", &[]));
        assert_eq!(result, Err(RegistryError::AlreadyRegistered("SDR".into())));
    }

    #[test]
    fn registration_order_does_not_matter() {
        let mut registry = StageRegistry::new();
        registry.register(stage("SDRTrees", &["SDR"])).unwrap();
        registry.register(stage("SDR", &[])).unwrap();

        let graph = registry.validate().unwrap();
        assert_eq!(
            graph.dependents_of(&TaskTypeName::new("SDR")),
            vec![TaskTypeName::new("SDRTrees")]
        );
        assert_eq!(
            registry.registered_names(),
            vec![TaskTypeName::new("SDR"), TaskTypeName::new("SDRTrees")]
        );
    }

    #[test]
    fn unknown_predecessor_fails_validation() {
        let mut registry = StageRegistry::new();
        registry.register(stage("SDRTrees", &["PreCommit2"])).unwrap();
        assert_eq!(
            registry.validate().unwrap_err(),
            RegistryError::UnknownPredecessor {
                stage: "SDRTrees".into(),
                predecessor: "PreCommit2".into(),
            }
        );
    }

    #[test]
    fn cycle_fails_validation() {
        let mut registry = StageRegistry::new();
        registry.register(stage("A", &["C"])).unwrap();
        registry.register(stage("B", &["A"])).unwrap();
        registry.register(stage("C", &["B"])).unwrap();

        let err = registry.validate().unwrap_err();
        let RegistryError::Cycle(cycle) = &err else {
            panic!("expected a cycle, got {err:?}");
        };
        assert_eq!(cycle.len(), 3);
        assert!(err.to_string().starts_with("stage dependency cycle: "));
    }
}
