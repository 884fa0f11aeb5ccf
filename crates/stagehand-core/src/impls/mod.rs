//! Impls - ports の実装
//!
//! - InMemoryTaskStore: 開発用・テスト用（1 プロセス内で複数ワーカーを共有）

pub mod inmem_store;

pub use self::inmem_store::InMemoryTaskStore;
