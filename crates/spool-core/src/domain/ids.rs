//! Domain identifiers (strongly-typed IDs).
//!
//! ジョブには 2 種類の ID があります:
//! - **JobUid**: ジョブ実体（JobRuntime）の識別子。生成時に採番され、payload に埋め込まれて
//!   リトライをまたいでも変わらない。ULID なので UUID 互換の 128-bit かつ時刻でソート可能。
//! - **RecordId**: ストア側の行 ID（surrogate key）。enqueue されたときに DB が採番する。
//!   JobRuntime から見ると「backend id」。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Identity of a job instance, generated when the job is constructed.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobUid(Ulid);

impl JobUid {
    /// ULID から JobUid を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// 現在時刻ベースの新しい JobUid
    ///
    /// Clock を差し替えたい場合は `IdGenerator` を使う。
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for JobUid {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl FromStr for JobUid {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("job-").unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}

impl fmt::Display for JobUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Surrogate key of a persisted job record (the "backend id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
