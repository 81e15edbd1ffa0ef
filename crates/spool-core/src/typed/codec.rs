//! PayloadCodec - JobRuntime と payload 文字列の相互変換
//!
//! payload は JSON の envelope:
//!
//! ```text
//! {"type":"mail.send.v1","uid":"01J..","backend_id":12,"queue":"default",
//!  "attempts":1,"enqueued_at":"2024-01-01T12:00:00Z","args":[..],"state":{..}}
//! ```
//!
//! 引数とジョブの状態は serde で構造ごと書き出すので、別プロセスで decode しても
//! 同じ値が復元される。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::Job;
use super::registry::JobRegistry;
use super::runtime::{DynJob, JobRuntime};
use crate::domain::{JobRecord, JobUid, RecordId};

/// Decoding / encoding failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown job type '{0}' (not registered)")]
    UnknownType(String),

    #[error("payload is for job type '{found}', expected '{expected}'")]
    TypeMismatch { expected: &'static str, found: String },

    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to serialize job '{job_type}': {source}")]
    Serialize {
        job_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Wire form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "type")]
    pub job_type: String,

    pub uid: JobUid,

    #[serde(default)]
    pub backend_id: Option<RecordId>,

    pub queue: String,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,

    pub args: serde_json::Value,

    /// The job value itself (its own fields).
    #[serde(default)]
    pub state: serde_json::Value,
}

/// PayloadCodec は stateless。関数の置き場所として struct にしている。
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<J: Job>(runtime: &JobRuntime<J>) -> Result<String, CodecError> {
        let envelope = runtime.to_envelope()?;
        serde_json::to_string(&envelope).map_err(|source| CodecError::Serialize {
            job_type: J::TYPE,
            source,
        })
    }

    /// Parse the envelope without resolving the job type.
    pub fn envelope(data: &str) -> Result<JobEnvelope, CodecError> {
        serde_json::from_str(data).map_err(CodecError::Malformed)
    }

    /// Decode into a known job type.
    pub fn decode_as<J: Job>(data: &str) -> Result<JobRuntime<J>, CodecError> {
        let envelope = Self::envelope(data)?;
        if envelope.job_type != J::TYPE {
            return Err(CodecError::TypeMismatch {
                expected: J::TYPE,
                found: envelope.job_type,
            });
        }
        JobRuntime::from_envelope(envelope)
    }

    /// Decode a row returned by `JobStore::claim_next`, keeping its lease so the
    /// runtime may report back to the store.
    pub fn decode_claimed<J: Job>(record: &JobRecord) -> Result<JobRuntime<J>, CodecError> {
        let mut runtime = Self::decode_as::<J>(&record.data)?;
        if let Some(lease) = record.lease() {
            runtime.bind_lease(lease);
        }
        Ok(runtime)
    }

    /// Decode by looking the job type up in `registry`.
    pub fn decode(registry: &JobRegistry, data: &str) -> Result<Box<dyn DynJob>, CodecError> {
        let envelope = Self::envelope(data)?;
        let factory = registry
            .factory(&envelope.job_type)
            .ok_or_else(|| CodecError::UnknownType(envelope.job_type.clone()))?;
        factory(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionError, Lease, NewJobRecord};
    use crate::typed::job::JobContext;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Address {
        city: String,
        tags: BTreeMap<String, i64>,
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Report {
        runs: u32,
    }

    #[async_trait]
    impl Job for Report {
        const TYPE: &'static str = "test.report.v1";
        type Args = (String, i64, Address);

        async fn execute(&mut self, _ctx: &JobContext, _args: &Self::Args) -> Result<(), ExecutionError> {
            self.runs += 1;
            Ok(())
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Other;

    #[async_trait]
    impl Job for Other {
        const TYPE: &'static str = "test.other.v1";
        type Args = ();

        async fn execute(&mut self, _ctx: &JobContext, _args: &()) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn sample() -> JobRuntime<Report> {
        let address = Address {
            city: "Kyoto".into(),
            tags: BTreeMap::from([("floor".to_string(), 3), ("room".to_string(), 301)]),
        };
        JobRuntime::new(Report { runs: 2 }, ("monthly".to_string(), 42, address)).on_queue("reports")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn round_trip_keeps_identity_queue_args_and_state() {
        let mut original = sample();
        original.bind_lease(Lease {
            record_id: RecordId::new(7),
            locked: t0(),
            attempts: 3,
        });
        let data = PayloadCodec::encode(&original).unwrap();

        let decoded = PayloadCodec::decode_as::<Report>(&data).unwrap();
        assert_eq!(decoded.uid(), original.uid());
        assert_eq!(decoded.queue(), "reports");
        assert_eq!(decoded.attempts(), 3);
        assert_eq!(decoded.backend_id(), Some(RecordId::new(7)));
        assert_eq!(decoded.args(), original.args());
        assert_eq!(decoded.job(), &Report { runs: 2 });

        // lease は payload に載らない
        assert_eq!(decoded.lease(), None);
    }

    #[test]
    fn decode_claimed_takes_lease_from_the_row() {
        let data = PayloadCodec::encode(&sample()).unwrap();
        let mut record = JobRecord::inserted(RecordId::new(4), NewJobRecord::new("reports", data, t0()), t0());
        record.claim(t0());

        let runtime = PayloadCodec::decode_claimed::<Report>(&record).unwrap();
        assert_eq!(runtime.lease(), record.lease());
        assert_eq!(runtime.backend_id(), Some(RecordId::new(4)));
        assert_eq!(runtime.attempts(), 1);
    }

    #[test]
    fn decode_through_registry() {
        let mut registry = JobRegistry::new();
        registry.register::<Report>().unwrap();

        let data = PayloadCodec::encode(&sample()).unwrap();
        let job = PayloadCodec::decode(&registry, &data).unwrap();
        assert_eq!(job.job_type(), Report::TYPE);
        assert_eq!(job.queue(), "reports");
    }

    #[test]
    fn unknown_type_names_the_type() {
        let registry = JobRegistry::new();
        let data = PayloadCodec::encode(&sample()).unwrap();

        let err = PayloadCodec::decode(&registry, &data).err().unwrap();
        assert!(matches!(err, CodecError::UnknownType(ref t) if t == "test.report.v1"));
        assert!(err.to_string().contains("test.report.v1"));
    }

    #[test]
    fn decode_as_rejects_other_types() {
        let data = PayloadCodec::encode(&JobRuntime::new(Other, ())).unwrap();
        let err = PayloadCodec::decode_as::<Report>(&data).err().unwrap();
        assert!(matches!(
            err,
            CodecError::TypeMismatch { expected: "test.report.v1", ref found } if found == "test.other.v1"
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let registry = JobRegistry::new();
        assert!(matches!(
            PayloadCodec::decode(&registry, "not json").err().unwrap(),
            CodecError::Malformed(_)
        ));
    }

    #[test]
    fn args_that_do_not_fit_are_malformed() {
        let data = serde_json::json!({
            "type": Report::TYPE,
            "uid": JobUid::generate(),
            "queue": "default",
            "args": "not a tuple",
        })
        .to_string();

        assert!(matches!(
            PayloadCodec::decode_as::<Report>(&data).err().unwrap(),
            CodecError::Malformed(_)
        ));
    }
}
