//! Errors - ジョブ実行エラーと分類
//!
//! ここで定義するのは「ジョブ自身の失敗」だけ。ストアや codec のエラーは
//! それぞれ `ports::job_store` / `typed::codec` に置いてある。

use std::time::Duration;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: ジョブが依存する外部システムの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// ExecutionError はユーザーの `execute` が返したエラー
///
/// ストアの fail/retry はエラーの種類に関係なく必ず試行される。
/// kind はログと `on_error` での判断材料。
#[derive(Debug)]
pub struct ExecutionError {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Permanent)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Infrastructure)
    }

    /// `execute` が deadline を超えた
    pub fn timed_out(limit: Duration) -> Self {
        Self::new(format!("execution exceeded timeout of {limit:?}"))
    }

    /// Wrap any error raised by user code.
    pub fn wrap<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: ErrorKind::Transient,
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "execution failed (kind: {:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<String> for ExecutionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ExecutionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
