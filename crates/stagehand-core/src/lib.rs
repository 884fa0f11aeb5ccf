//! stagehand-core
//!
//! Scheduling core for multi-stage jobs run by a fleet of workers that share
//! nothing but a coordination store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, resources, task rows, worker rows, pipelines, history, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **stage**: タスク種別の契約（Stage trait, StageRegistry, StageGraph, OwnershipProbe）
//! - **app**: スケジューリング（TaskEngine, ResourceLedger, LeaseManager, DependencyPoller, など）
//! - **impls**: 実装（InMemoryTaskStore など開発用）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod stage;

pub use app::{EngineBuilder, EngineGroup, StatusReport, TaskEngine};
pub use config::EngineConfig;
pub use domain::{Resources, StageDetails, TaskError, TaskId, TaskTypeName};
pub use impls::InMemoryTaskStore;
pub use stage::{OwnershipProbe, Stage, TaskContext};
