//! App - アプリケーション層
//!
//! このモジュールは、ports と stage を組み合わせてスケジューリングを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: stage の登録と起動時検証
//! - **TaskEngine**: discover → claim → execute → finalize
//! - **ResourceLedger**: ワーカー容量の帳簿
//! - **LeaseManager**: 所有権の CAS
//! - **FailureTracker**: 失敗回数と終端判定
//! - **DependencyPoller**: 次段の行を挿入
//! - **HeartbeatLoop / EngineGroup**: バックグラウンドループの束
//! - **StatusReport**: 運用者向けビュー

pub mod backoff;
pub mod builder;
pub mod engine;
pub mod failure;
pub mod group;
pub mod heartbeat;
pub mod lease;
pub mod ledger;
pub mod poller;
pub mod status;

// 主要な型を再エクスポート
pub use self::backoff::{Backoff, BackoffPolicy};
pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::{ClaimedTask, EngineError, ExecutionOutcome, ExecutionReport, TaskEngine};
pub use self::failure::{FailureDecision, FailureTracker};
pub use self::group::EngineGroup;
pub use self::heartbeat::HeartbeatLoop;
pub use self::lease::LeaseManager;
pub use self::ledger::ResourceLedger;
pub use self::poller::DependencyPoller;
pub use self::status::{FailedTask, StatusReport};
