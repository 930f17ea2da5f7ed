use std::sync::Arc;

use anyhow::{Context, Result};
use async_nats::jetstream::{
    consumer::{
        push::{Config as PushConfig, Messages},
        AckPolicy,
    },
    stream::{Config as StreamConfig, RetentionPolicy},
};
use futures::StreamExt;
use wg_core::bus::NatsBusClient;
use wg_core::provider::HttpProviderClient;
use wg_core::subjects::{OUT_STREAM, OUT_SUBJECTS};
use wg_core::telemetry::install as init_telemetry;
use wg_core::types::OutboundJob;
use wg_dlq::NatsDlqPublisher;
use wg_outbound::{Dispatcher, JetStreamBootstrapSink, WorkerConfig};
use wg_ratelimit::{HybridRateStore, RateLimiter};
use wg_store::{Store, TenantRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("wg-outbound");
    let config = WorkerConfig::from_env();

    let store = Store::open(&config.database_path)?;
    let registry = TenantRegistry::new(store.clone());

    let client = async_nats::connect(&config.nats_url).await?;
    let js = async_nats::jetstream::new(client.clone());

    let rate_store = HybridRateStore::new(Some(&js), &config.rate_kv_namespace).await?;
    let limiter = RateLimiter::new(rate_store);
    let provider = Arc::new(HttpProviderClient::new(config.provider_api_base.clone())?);
    let bus = Arc::new(NatsBusClient::new(client.clone()));
    let dlq = Arc::new(NatsDlqPublisher::new(client.clone()).await?);
    let bootstrap = Arc::new(JetStreamBootstrapSink::new(client.clone()).await?);

    let dispatcher = Dispatcher::new(
        store,
        registry,
        provider,
        limiter,
        bus,
        dlq,
        bootstrap,
        config.clone(),
    );

    let mut messages = attach_consumer(&js).await?;
    tracing::info!(stream = OUT_STREAM, "wg-outbound consuming outbound jobs");

    while let Some(next) = messages.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!("jetstream message error: {err}");
                continue;
            }
        };

        let job: OutboundJob = match serde_json::from_slice(msg.payload.as_ref()) {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!("bad outbound job dropped: {err}");
                let _ = msg.ack().await;
                continue;
            }
        };

        // The lane acks after the job reaches a terminal outcome; retries
        // happen inside the lane so redelivery never reorders a
        // conversation.
        let done = dispatcher.submit(job).await;
        tokio::spawn(async move {
            let _ = done.await;
            if let Err(err) = msg.ack().await {
                tracing::error!("ack failed: {err}");
            }
        });
    }

    Ok(())
}

/// Single ordered push consumer over the work queue. One active worker
/// process keeps the per-conversation FIFO guarantee; lanes provide the
/// parallelism.
async fn attach_consumer(js: &async_nats::jetstream::Context) -> Result<Messages> {
    let stream_cfg = StreamConfig {
        name: OUT_STREAM.into(),
        subjects: vec![OUT_SUBJECTS.into()],
        retention: RetentionPolicy::WorkQueue,
        max_messages: -1,
        max_messages_per_subject: -1,
        max_bytes: -1,
        ..Default::default()
    };
    let stream = js
        .get_or_create_stream(stream_cfg)
        .await
        .context("ensure outbound stream")?;

    let consumer_name = "wa-out-worker".to_string();
    let consumer = stream
        .get_or_create_consumer(
            &consumer_name,
            PushConfig {
                durable_name: Some(consumer_name.clone()),
                deliver_subject: "deliver.wa-out".into(),
                ack_policy: AckPolicy::Explicit,
                max_ack_pending: 256,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("ensure consumer {consumer_name}"))?;

    consumer
        .messages()
        .await
        .context("attach outbound consumer")
}
