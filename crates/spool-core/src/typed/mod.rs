//! Typed - 型付き Job API
//!
//! job type の文字列を `Job::TYPE` に閉じ込め、decode 先を registry で静的に決める。
//!
//! # 二層構造
//! - **表層（Typed）**: `Job` trait, `JobRuntime<J>` - 型安全
//! - **内部（Dyn）**: `DynJob` trait - object-safe, type erasure

pub mod codec;
pub mod job;
pub mod registry;
pub mod runtime;

// 主要な trait/型 を再エクスポート
pub use self::codec::{CodecError, JobEnvelope, PayloadCodec};
pub use self::job::{Job, JobContext, RetryOptions};
pub use self::registry::{DecodeFn, JobRegistry, RegistryError};
pub use self::runtime::{DynJob, JobRuntime, RunOutcome};
