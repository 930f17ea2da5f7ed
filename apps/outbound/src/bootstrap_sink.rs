//! Where bootstrap jobs go after the first successful welcome send.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy},
    Context as JsContext,
};
use async_trait::async_trait;
use tokio::sync::Mutex;
use wg_core::subjects::{self, BOOTSTRAP_STREAM, BOOTSTRAP_SUBJECTS};
use wg_core::types::BootstrapJob;

#[async_trait]
pub trait BootstrapSink: Send + Sync {
    async fn enqueue(&self, job: BootstrapJob) -> Result<()>;
}

pub type SharedBootstrapSink = Arc<dyn BootstrapSink>;

pub struct JetStreamBootstrapSink {
    js: JsContext,
}

impl JetStreamBootstrapSink {
    pub async fn new(client: async_nats::Client) -> Result<Self> {
        let js = async_nats::jetstream::new(client);
        ensure_bootstrap_stream(&js).await?;
        Ok(Self { js })
    }
}

pub async fn ensure_bootstrap_stream(js: &JsContext) -> Result<()> {
    let cfg = StreamConfig {
        name: BOOTSTRAP_STREAM.into(),
        subjects: vec![BOOTSTRAP_SUBJECTS.into()],
        retention: RetentionPolicy::WorkQueue,
        max_messages: -1,
        max_messages_per_subject: -1,
        max_bytes: -1,
        ..Default::default()
    };
    match js.get_stream(BOOTSTRAP_STREAM).await {
        Ok(_) => Ok(()),
        Err(_) => {
            js.create_stream(cfg)
                .await
                .context("create bootstrap stream")?;
            Ok(())
        }
    }
}

#[async_trait]
impl BootstrapSink for JetStreamBootstrapSink {
    async fn enqueue(&self, job: BootstrapJob) -> Result<()> {
        let subject = subjects::bootstrap_subject(&job.tenant_id);
        let payload = serde_json::to_vec(&job)?;
        self.js
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("enqueue bootstrap job on {subject}"))?;
        Ok(())
    }
}

/// Captures bootstrap jobs in worker tests.
#[derive(Clone, Default)]
pub struct InMemoryBootstrapSink {
    jobs: Arc<Mutex<Vec<BootstrapJob>>>,
}

impl InMemoryBootstrapSink {
    pub async fn take(&self) -> Vec<BootstrapJob> {
        let mut guard = self.jobs.lock().await;
        std::mem::take(&mut *guard)
    }
}

#[async_trait]
impl BootstrapSink for InMemoryBootstrapSink {
    async fn enqueue(&self, job: BootstrapJob) -> Result<()> {
        self.jobs.lock().await.push(job);
        Ok(())
    }
}
