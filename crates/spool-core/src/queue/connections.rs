//! QueueConnections - 名前付き Queue の一覧
//!
//! プロセス起動時に一度だけ組み立て、`Arc` で worker / producer に渡す。
//! グローバルな接続テーブルは持たない。

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::Queue;
use crate::config::{ConnectionConfig, SpoolConfig};
use crate::impls::{MemoryJobStore, PgJobStore};
use crate::ports::{JobStore, StoreError};
use crate::typed::JobRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no queue connection named '{0}'")]
    Unknown(String),

    #[error("failed to open connection '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone)]
pub struct QueueConnections {
    default_name: String,
    queues: BTreeMap<String, Queue>,
}

impl QueueConnections {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            default_name: default_name.into(),
            queues: BTreeMap::new(),
        }
    }

    /// Register a queue under its own name (replacing any previous one).
    pub fn insert(&mut self, queue: Queue) {
        self.queues.insert(queue.name().to_string(), queue);
    }

    pub fn with(mut self, queue: Queue) -> Self {
        self.insert(queue);
        self
    }

    /// The queue configured under `name`.
    pub fn connection(&self, name: &str) -> Result<&Queue, ConnectionError> {
        self.queues
            .get(name)
            .ok_or_else(|| ConnectionError::Unknown(name.to_string()))
    }

    pub fn default_connection(&self) -> Result<&Queue, ConnectionError> {
        self.connection(&self.default_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Open every connection in `config`. PostgreSQL connections are migrated.
    pub async fn connect(config: &SpoolConfig, registry: Arc<JobRegistry>) -> Result<Self, ConnectionError> {
        let mut connections = Self::new(config.default_connection.clone());

        for (name, connection) in &config.connections {
            let store: Arc<dyn JobStore> = match connection {
                ConnectionConfig::Memory => Arc::new(MemoryJobStore::new()),
                ConnectionConfig::Postgres { url, max_connections } => {
                    let store = PgJobStore::connect(url, *max_connections)
                        .await
                        .map_err(|source| ConnectionError::Open {
                            name: name.clone(),
                            source,
                        })?;
                    store.migrate().await.map_err(|source| ConnectionError::Open {
                        name: name.clone(),
                        source,
                    })?;
                    Arc::new(store)
                }
            };

            info!(connection = %name, driver = driver_name(connection), "queue connection opened");
            connections.insert(
                Queue::new(name.clone(), store, Arc::clone(&registry)).with_retry_policy(config.retry.clone()),
            );
        }

        Ok(connections)
    }
}

fn driver_name(connection: &ConnectionConfig) -> &'static str {
    match connection {
        ConnectionConfig::Memory => "memory",
        ConnectionConfig::Postgres { .. } => "postgres",
    }
}
