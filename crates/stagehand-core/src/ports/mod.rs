//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（共有ストア、時刻、ID 生成）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - 共有ストアが source of truth（正本）
//! - ワーカーは自分が lease しているタスク以外の状態を持たない

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{ReadyPipeline, StoreError, TaskCounts, TaskStore, Transition};
