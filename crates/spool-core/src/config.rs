//! Configuration: named connections, worker settings, retry defaults.
//!
//! 環境変数（`.env` も読む）:
//! - `SPOOL_DATABASE_URL`: 指定すると default 接続が PostgreSQL になる（無ければ memory）
//! - `SPOOL_MAX_CONNECTIONS`
//! - `SPOOL_QUEUE`, `SPOOL_WORKERS`, `SPOOL_POLL_INTERVAL_MS`, `SPOOL_LOCK_TIMEOUT_SECS`
//! - `SPOOL_MAX_ATTEMPTS`
//! - `SPOOL_LOG_FORMAT` (`pretty` | `json`)

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::DEFAULT_QUEUE;
use crate::observability::LogFormat;
use crate::queue::RetryPolicy;

pub const DEFAULT_CONNECTION: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How to reach one job store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Memory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

/// Settings for one worker group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue name the workers claim from.
    pub queue: String,

    pub concurrency: usize,

    /// Sleep between polls when the queue is empty.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Locks older than this are considered abandoned.
    #[serde(with = "duration_millis")]
    pub lock_timeout: Duration,

    /// How often the reaper looks for abandoned locks.
    #[serde(with = "duration_millis")]
    pub reap_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            lock_timeout: Duration::from_secs(15 * 60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub default_connection: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub log_format: LogFormat,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            default_connection: DEFAULT_CONNECTION.to_string(),
            connections: BTreeMap::from([(DEFAULT_CONNECTION.to_string(), ConnectionConfig::Memory)]),
            worker: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl SpoolConfig {
    /// Load `.env` (if any) and read `SPOOL_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env が無いのは普通
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (unset keys keep their defaults).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SPOOL_DATABASE_URL") {
            let max_connections = match lookup("SPOOL_MAX_CONNECTIONS") {
                Some(raw) => parse("SPOOL_MAX_CONNECTIONS", &raw)?,
                None => default_max_connections(),
            };
            config.connections.insert(
                DEFAULT_CONNECTION.to_string(),
                ConnectionConfig::Postgres { url, max_connections },
            );
        }

        if let Some(queue) = lookup("SPOOL_QUEUE") {
            config.worker.queue = queue;
        }
        if let Some(raw) = lookup("SPOOL_WORKERS") {
            config.worker.concurrency = parse("SPOOL_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("SPOOL_POLL_INTERVAL_MS") {
            config.worker.poll_interval = Duration::from_millis(parse("SPOOL_POLL_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = lookup("SPOOL_LOCK_TIMEOUT_SECS") {
            config.worker.lock_timeout = Duration::from_secs(parse("SPOOL_LOCK_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("SPOOL_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse("SPOOL_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("SPOOL_LOG_FORMAT") {
            config.log_format = match raw.to_ascii_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "SPOOL_LOG_FORMAT",
                        value: raw,
                        reason: "expected 'pretty' or 'json'".to_string(),
                    });
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "worker.concurrency",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "retry.max_attempts",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.connections.contains_key(&self.default_connection) {
            return Err(ConfigError::Invalid {
                key: "default_connection",
                value: self.default_connection.clone(),
                reason: "no connection with that name".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_use_an_in_memory_connection() {
        let config = SpoolConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SpoolConfig::default());
        assert_eq!(
            config.connections.get(DEFAULT_CONNECTION),
            Some(&ConnectionConfig::Memory)
        );
    }

    #[test]
    fn reads_spool_variables() {
        let config = SpoolConfig::from_lookup(lookup(&[
            ("SPOOL_DATABASE_URL", "postgres://localhost/spool"),
            ("SPOOL_QUEUE", "mail"),
            ("SPOOL_WORKERS", "8"),
            ("SPOOL_POLL_INTERVAL_MS", "250"),
            ("SPOOL_LOCK_TIMEOUT_SECS", "30"),
            ("SPOOL_MAX_ATTEMPTS", "3"),
            ("SPOOL_LOG_FORMAT", "JSON"),
        ]))
        .unwrap();

        assert_eq!(
            config.connections.get(DEFAULT_CONNECTION),
            Some(&ConnectionConfig::Postgres {
                url: "postgres://localhost/spool".to_string(),
                max_connections: 10,
            })
        );
        assert_eq!(config.worker.queue, "mail");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[rstest]
    #[case("SPOOL_WORKERS", "many")]
    #[case("SPOOL_WORKERS", "0")]
    #[case("SPOOL_MAX_ATTEMPTS", "-1")]
    #[case("SPOOL_MAX_ATTEMPTS", "0")]
    #[case("SPOOL_POLL_INTERVAL_MS", "1.5")]
    #[case("SPOOL_LOG_FORMAT", "xml")]
    fn malformed_values_are_rejected(#[case] key: &str, #[case] value: &str) {
        let result = SpoolConfig::from_lookup(lookup(&[(key, value)]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn deserializes_named_connections() {
        let config: SpoolConfig = serde_json::from_str(
            r#"{
                "default_connection": "primary",
                "connections": {
                    "primary": { "driver": "postgres", "url": "postgres://db/jobs" },
                    "scratch": { "driver": "memory" }
                },
                "worker": { "queue": "reports", "poll_interval": 100 }
            }"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.connections.len(), 2);
        assert_eq!(config.worker.queue, "reports");
        assert_eq!(config.worker.poll_interval, Duration::from_millis(100));
        assert_eq!(config.worker.concurrency, 4);
    }

    #[test]
    fn default_connection_must_exist() {
        let config = SpoolConfig {
            default_connection: "missing".to_string(),
            ..SpoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
