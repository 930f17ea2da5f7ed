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
use wg_bootstrap::{BootstrapConfig, BootstrapWorker};
use wg_core::catalog::HttpCatalogClient;
use wg_core::subjects::{BOOTSTRAP_STREAM, BOOTSTRAP_SUBJECTS};
use wg_core::telemetry::install as init_telemetry;
use wg_core::types::BootstrapJob;
use wg_ratelimit::{HybridRateStore, RateLimiter};
use wg_store::{Store, TenantRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("wg-bootstrap");
    let config = BootstrapConfig::from_env();

    let store = Store::open(&config.database_path)?;
    let registry = TenantRegistry::new(store);

    let client = async_nats::connect(&config.nats_url).await?;
    let js = async_nats::jetstream::new(client.clone());
    let rate_store = HybridRateStore::new(Some(&js), &config.rate_kv_namespace).await?;
    let limiter = RateLimiter::new(rate_store);

    let catalog = Arc::new(HttpCatalogClient::new(
        config.catalog_api_base.clone(),
        config.catalog_api_key.clone(),
    )?);

    let worker = BootstrapWorker::new(registry, catalog, limiter, config.clone());

    let mut messages = attach_consumer(&js).await?;
    tracing::info!(stream = BOOTSTRAP_STREAM, "wg-bootstrap consuming prefetch jobs");

    while let Some(next) = messages.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!("jetstream message error: {err}");
                continue;
            }
        };
        let job: BootstrapJob = match serde_json::from_slice(msg.payload.as_ref()) {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!("bad bootstrap job dropped: {err}");
                let _ = msg.ack().await;
                continue;
            }
        };

        // Failures never propagate to the user; the worker retries
        // internally, so the message is always consumed.
        let worker = worker.clone();
        tokio::spawn(async move {
            worker.process(job).await;
            if let Err(err) = msg.ack().await {
                tracing::error!("ack failed: {err}");
            }
        });
    }

    Ok(())
}

async fn attach_consumer(js: &async_nats::jetstream::Context) -> Result<Messages> {
    let stream_cfg = StreamConfig {
        name: BOOTSTRAP_STREAM.into(),
        subjects: vec![BOOTSTRAP_SUBJECTS.into()],
        retention: RetentionPolicy::WorkQueue,
        max_messages: -1,
        max_messages_per_subject: -1,
        max_bytes: -1,
        ..Default::default()
    };
    let stream = js
        .get_or_create_stream(stream_cfg)
        .await
        .context("ensure bootstrap stream")?;

    let consumer_name = "wa-bootstrap-worker".to_string();
    let consumer = stream
        .get_or_create_consumer(
            &consumer_name,
            PushConfig {
                durable_name: Some(consumer_name.clone()),
                deliver_subject: "deliver.wa-bootstrap".into(),
                ack_policy: AckPolicy::Explicit,
                max_ack_pending: 64,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("ensure consumer {consumer_name}"))?;

    consumer
        .messages()
        .await
        .context("attach bootstrap consumer")
}
