//! JobRegistry - job type 文字列から decode 関数を引く
//!
//! 実行時に型名からインスタンスを作る代わりに、起動時に
//! `register::<J>()` で `J::TYPE → decode 関数` を登録しておく。
//! 未登録の type を持つ payload は `CodecError::UnknownType` になる。

use std::collections::HashMap;

use super::codec::{CodecError, JobEnvelope, PayloadCodec};
use super::job::Job;
use super::runtime::{DynJob, JobRuntime};

/// Builds a type-erased runtime from an envelope whose type is already known.
pub type DecodeFn = fn(JobEnvelope) -> Result<Box<dyn DynJob>, CodecError>;

fn decode_boxed<J: Job>(envelope: JobEnvelope) -> Result<Box<dyn DynJob>, CodecError> {
    Ok(Box::new(JobRuntime::<J>::from_envelope(envelope)?))
}

/// RegistryError は JobRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job type '{0}' is already registered")]
    AlreadyRegistered(&'static str),
}

/// JobRegistry は起動時に一度組み立て、以後は `Arc` で共有する（読み取り専用）
///
/// # 使用例
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register::<SendMail>()?;
/// let job = registry.decode(&record.data)?;
/// ```
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<&'static str, DecodeFn>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: Job>(&mut self) -> Result<(), RegistryError> {
        if self.factories.contains_key(J::TYPE) {
            return Err(RegistryError::AlreadyRegistered(J::TYPE));
        }
        self.factories.insert(J::TYPE, decode_boxed::<J>);
        Ok(())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn factory(&self, job_type: &str) -> Option<DecodeFn> {
        self.factories.get(job_type).copied()
    }

    /// Registered type keys, sorted.
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn decode(&self, data: &str) -> Result<Box<dyn DynJob>, CodecError> {
        PayloadCodec::decode(self, data)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
