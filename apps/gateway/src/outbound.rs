//! Idempotent enqueue onto the outbound JetStream work queue.
//!
//! The subject tail `{tenant}.{conversation}` is the FIFO sub-key the
//! worker preserves; enqueue order on one conversation is delivery order.

use anyhow::{Context, Result};
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy},
    Context as JsContext,
};
use async_trait::async_trait;
use tracing::debug;
use wg_core::subjects::{self, OUT_STREAM, OUT_SUBJECTS};
use wg_core::types::OutboundJob;
use wg_flow::{OutboundEnqueuer, SharedEnqueuer};
use wg_idempotency::{IdemKey, IdempotencyGuard};

/// Drops re-enqueues of the same `request_id` before they reach the queue;
/// N identical enqueues are equivalent to one.
pub struct DedupingEnqueuer {
    idem: IdempotencyGuard,
    inner: SharedEnqueuer,
}

impl DedupingEnqueuer {
    pub fn new(idem: IdempotencyGuard, inner: SharedEnqueuer) -> Self {
        Self { idem, inner }
    }
}

#[async_trait]
impl OutboundEnqueuer for DedupingEnqueuer {
    async fn enqueue(&self, job: OutboundJob) -> Result<()> {
        let key = IdemKey::Job(job.request_id.clone());
        if !self.idem.try_acquire(&key).await? {
            debug!(request_id = %job.request_id, "duplicate enqueue dropped");
            return Ok(());
        }
        self.inner.enqueue(job).await
    }
}

/// Publishes jobs onto the `wa-out` work-queue stream.
pub struct JetStreamEnqueuer {
    js: JsContext,
}

impl JetStreamEnqueuer {
    pub async fn new(client: async_nats::Client) -> Result<Self> {
        let js = async_nats::jetstream::new(client);
        ensure_out_stream(&js).await?;
        Ok(Self { js })
    }
}

pub async fn ensure_out_stream(js: &JsContext) -> Result<()> {
    let cfg = StreamConfig {
        name: OUT_STREAM.into(),
        subjects: vec![OUT_SUBJECTS.into()],
        retention: RetentionPolicy::WorkQueue,
        max_messages: -1,
        max_messages_per_subject: -1,
        max_bytes: -1,
        ..Default::default()
    };
    match js.get_stream(OUT_STREAM).await {
        Ok(_) => Ok(()),
        Err(_) => {
            js.create_stream(cfg)
                .await
                .context("create outbound stream")?;
            Ok(())
        }
    }
}

#[async_trait]
impl OutboundEnqueuer for JetStreamEnqueuer {
    async fn enqueue(&self, job: OutboundJob) -> Result<()> {
        let subject = subjects::out_subject(&job.tenant_id, &job.conversation_id);
        let payload = serde_json::to_vec(&job)?;
        self.js
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("enqueue outbound job on {subject}"))?
            .await
            .with_context(|| format!("outbound enqueue unacked on {subject}"))?;
        metrics::counter!("outbound_enqueued", "tenant" => job.tenant_id.clone()).increment(1);
        Ok(())
    }
}
