//! Stage - タスク種別の契約と登録
//!
//! - **interface**: `Stage` trait, `TaskContext`, `SchedulerView`
//! - **registry**: 名前 → Stage の登録簿
//! - **graph**: follows から作る DAG（循環検出つき）
//! - **probe**: 実行中の所有権確認（lease 延長を兼ねる）
//! - **adder**: stage 自身が行を挿入するためのハンドル

pub mod adder;
pub mod graph;
pub mod interface;
pub mod probe;
pub mod registry;

pub use self::adder::AddTaskHandle;
pub use self::graph::StageGraph;
pub use self::interface::{SchedulerView, Stage, TaskContext};
pub use self::probe::OwnershipProbe;
pub use self::registry::{RegisteredStage, RegistryError, StageRegistry};
