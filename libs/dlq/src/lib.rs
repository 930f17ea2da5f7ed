//! Dead-letter publishing for jobs that failed terminally or exhausted
//! their retry budget.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy},
    Context as JsContext,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::info;

const DLQ_STREAM_NAME: &str = "wa-dlq";
const DLQ_SUBJECTS: &str = "wa.dlq.>";

/// Failure metadata stored alongside each dead-lettered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqError {
    pub code: String,
    pub message: String,
}

/// Payload stored for each dead-lettered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub tenant: String,
    pub stage: String,
    pub job_id: String,
    pub attempts: u32,
    pub ts: String,
    pub error: DlqError,
    pub job: Value,
}

fn dlq_subject(tenant: &str, stage: &str) -> String {
    format!("wa.dlq.{tenant}.{stage}")
}

/// Sink abstraction so workers can be tested without a broker.
#[async_trait]
pub trait DlqSink: Send + Sync {
    async fn publish(&self, record: DlqRecord) -> Result<()>;
}

pub type SharedDlq = Arc<dyn DlqSink>;

/// Builds a record with the current timestamp and the serialized job.
pub fn record<S: Serialize>(
    tenant: &str,
    stage: &str,
    job_id: &str,
    attempts: u32,
    error: DlqError,
    job: &S,
) -> Result<DlqRecord> {
    Ok(DlqRecord {
        tenant: tenant.to_string(),
        stage: stage.to_string(),
        job_id: job_id.to_string(),
        attempts,
        ts: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into()),
        error,
        job: serde_json::to_value(job)?,
    })
}

/// JetStream-backed publisher; entries land on `wa.dlq.{tenant}.{stage}`.
#[derive(Clone)]
pub struct NatsDlqPublisher {
    js: JsContext,
}

impl NatsDlqPublisher {
    pub async fn new(client: async_nats::Client) -> Result<Self> {
        let js = async_nats::jetstream::new(client);
        ensure_stream(&js).await?;
        Ok(Self { js })
    }
}

#[async_trait]
impl DlqSink for NatsDlqPublisher {
    async fn publish(&self, record: DlqRecord) -> Result<()> {
        let subject = dlq_subject(&record.tenant, &record.stage);
        let payload = serde_json::to_vec(&record)?;
        self.js
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("publish DLQ entry to {subject}"))?;

        metrics::counter!(
            "dlq_published",
            "tenant" => record.tenant.clone(),
            "stage" => record.stage.clone(),
            "code" => record.error.code.clone()
        )
        .increment(1);
        info!(
            tenant = %record.tenant,
            stage = %record.stage,
            job_id = %record.job_id,
            code = %record.error.code,
            "dlq entry published"
        );
        Ok(())
    }
}

async fn ensure_stream(js: &JsContext) -> Result<()> {
    let cfg = StreamConfig {
        name: DLQ_STREAM_NAME.into(),
        subjects: vec![DLQ_SUBJECTS.into()],
        retention: RetentionPolicy::WorkQueue,
        max_messages_per_subject: -1,
        max_messages: -1,
        max_bytes: -1,
        description: Some("Wagate dead letters".into()),
        ..StreamConfig::default()
    };

    match js.get_stream(DLQ_STREAM_NAME).await {
        Ok(_) => Ok(()),
        Err(_) => {
            js.create_stream(cfg).await.context("create DLQ stream")?;
            Ok(())
        }
    }
}

/// Captures dead letters for worker tests.
#[derive(Clone, Default)]
pub struct InMemoryDlq {
    records: Arc<Mutex<Vec<DlqRecord>>>,
}

impl InMemoryDlq {
    pub async fn take(&self) -> Vec<DlqRecord> {
        let mut guard = self.records.lock().await;
        std::mem::take(&mut *guard)
    }
}

#[async_trait]
impl DlqSink for InMemoryDlq {
    async fn publish(&self, record: DlqRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_includes_tenant_and_stage() {
        assert_eq!(dlq_subject("t1", "outbound"), "wa.dlq.t1.outbound");
    }

    #[test]
    fn record_round_trips_json() {
        let rec = record(
            "t1",
            "outbound",
            "job-1",
            3,
            DlqError {
                code: "E_TERMINAL".into(),
                message: "invalid recipient".into(),
            },
            &serde_json::json!({"body": "hi"}),
        )
        .unwrap();
        let raw = serde_json::to_string(&rec).unwrap();
        let parsed: DlqRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.job_id, "job-1");
        assert_eq!(parsed.attempts, 3);
        assert_eq!(parsed.error.code, "E_TERMINAL");
        assert_eq!(parsed.job["body"], "hi");
    }

    #[tokio::test]
    async fn in_memory_sink_captures() {
        let sink = InMemoryDlq::default();
        let rec = record(
            "t1",
            "bootstrap",
            "job-2",
            1,
            DlqError {
                code: "E_FETCH".into(),
                message: "catalog 500".into(),
            },
            &serde_json::json!({}),
        )
        .unwrap();
        sink.publish(rec).await.unwrap();
        let taken = sink.take().await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].stage, "bootstrap");
    }
}
