//! タスク本体と admission から返るエラー
//!
//! # 分類
//! - Transient: 一時的なエラー（failure_count を加算してリトライ）
//! - Invariant: データ不整合（即座に Failed、リトライしない）

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// I/O や外部依存の失敗。`max_failures` に数える
    #[error("{0}")]
    Transient(String),

    /// 壊れた・矛盾した状態（例: "expected 1 row, got 2"）
    /// リトライしない
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        TaskError::Transient(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        TaskError::Invariant(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Invariant(format!("payload decode: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(TaskError::transient("disk full").is_retryable());
        assert!(!TaskError::invariant("expected 1 sector, got 2").is_retryable());
    }

    #[test]
    fn invariant_message_is_prefixed() {
        let e = TaskError::invariant("expected 1 sector, got 2");
        assert_eq!(e.to_string(), "invariant violated: expected 1 sector, got 2");
    }
}
