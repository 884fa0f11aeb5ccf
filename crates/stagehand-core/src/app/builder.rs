//! EngineBuilder - engine の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 設定値の検証（EngineConfig::validate）
//! - expect_stages() で期待される stage 名を登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - follows の未知参照・循環は build() で拒否（登録順は自由）
//!
//! # 使用例
//! ```ignore
//! let engine = EngineBuilder::new(store)
//!     .with_config(config)
//!     .register(PreCommit2)?
//!     .register(Trees)?
//!     .expect_stages(&["PreCommit2", "SDRTrees"])
//!     .build()?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::engine::TaskEngine;
use super::poller::DependencyPoller;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::TaskTypeName;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::stage::{AddTaskHandle, RegistryError, Stage, StageRegistry};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing stages: {0:?}. These stages were expected but not registered.")]
    MissingStages(Vec<String>),

    #[error("stage {0} is fed externally but also follows other stages")]
    ExternalWithFollows(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct EngineBuilder {
    store: Arc<dyn TaskStore>,
    registry: StageRegistry,
    expected_stages: Option<Vec<String>>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            registry: StageRegistry::new(),
            expected_stages: None,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 省略時は builder の clock を使う `UlidGenerator`
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn register<S: Stage>(mut self, stage: S) -> Result<Self, RegistryError> {
        self.registry.register(stage)?;
        Ok(self)
    }

    /// 同一プロセスの他の engine と共有する stage を登録
    pub fn register_shared(mut self, stage: Arc<dyn Stage>) -> Result<Self, RegistryError> {
        self.registry.register_arc(stage)?;
        Ok(self)
    }

    pub fn expect_stages(mut self, stages: &[&str]) -> Self {
        self.expected_stages = Some(stages.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<TaskEngine, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_stages {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| self.registry.get(&TaskTypeName::new(name.as_str())).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingStages(missing));
            }
        }

        if let Some(external) = self
            .registry
            .iter()
            .find(|r| r.details.fed_externally && !r.details.follows.is_empty())
        {
            return Err(BuildError::ExternalWithFollows(external.name().to_string()));
        }

        let graph = self.registry.validate()?;

        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };
        let worker = ids.generate_worker_id();

        let mut pollers = BTreeMap::new();
        for registered in self.registry.iter() {
            let details = &registered.details;
            registered.stage.on_register(AddTaskHandle::new(
                details,
                Arc::clone(&self.store),
                Arc::clone(&ids),
                Arc::clone(&self.clock),
            ));
            if !details.fed_externally {
                let poller = DependencyPoller::new(
                    details,
                    Arc::clone(&self.store),
                    Arc::clone(&ids),
                    Arc::clone(&self.clock),
                );
                pollers.insert(details.name.clone(), Arc::new(poller));
            }
        }

        Ok(TaskEngine::new(
            worker,
            self.config,
            self.registry,
            graph,
            self.store,
            self.clock,
            pollers,
        ))
    }
}
