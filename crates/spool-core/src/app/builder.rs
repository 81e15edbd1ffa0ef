//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - `expect_jobs()` で期待される job type を登録
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば `BuildError::MissingJobTypes`

use std::sync::Arc;

use crate::config::{ConfigError, SpoolConfig};
use crate::queue::{ConnectionError, QueueConnections};
use crate::typed::{Job, JobRegistry, RegistryError};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .config(SpoolConfig::from_env()?)
///     .register::<SendMail>()?
///     .expect_jobs(&["mail.send.v1"])
///     .build()
///     .await?;
///
/// let queue = app.connections.default_connection()?;
/// ```
pub struct AppBuilder {
    registry: JobRegistry,
    expected_jobs: Option<Vec<String>>,
    config: SpoolConfig,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing job types: {0:?}. These jobs were expected but not registered.")]
    MissingJobTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: JobRegistry::new(),
            expected_jobs: None,
            config: SpoolConfig::default(),
        }
    }

    pub fn config(mut self, config: SpoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Job 型を登録
    pub fn register<J: Job>(mut self) -> Result<Self, RegistryError> {
        self.registry.register::<J>()?;
        Ok(self)
    }

    /// 期待される job type のリストを設定
    pub fn expect_jobs(mut self, job_types: &[&str]) -> Self {
        self.expected_jobs = Some(job_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// 検証してから全接続を開く
    pub async fn build(self) -> Result<App, BuildError> {
        if let Some(expected_jobs) = &self.expected_jobs {
            let missing: Vec<String> = expected_jobs
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobTypes(missing));
            }
        }
        self.config.validate()?;

        let jobs = Arc::new(self.registry);
        let connections = QueueConnections::connect(&self.config, Arc::clone(&jobs)).await?;

        Ok(App {
            jobs,
            connections: Arc::new(connections),
            config: self.config,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は起動済みの registry と接続一覧
///
/// どちらも `Arc` なので worker / producer にそのまま clone して渡せる。
pub struct App {
    pub jobs: Arc<JobRegistry>,
    pub connections: Arc<QueueConnections>,
    pub config: SpoolConfig,
}
