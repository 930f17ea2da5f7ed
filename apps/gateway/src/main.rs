use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use wg_core::bus::NatsBusClient;
use wg_core::catalog::HttpCatalogClient;
use wg_core::subjects;
use wg_core::telemetry::install as init_telemetry;
use wg_flow::{FlowEngine, HttpOrderApi, SharedEnqueuer};
use wg_gateway::{
    config::GatewayConfig,
    http::build_router,
    outbound::{DedupingEnqueuer, JetStreamEnqueuer},
    AppState,
};
use wg_idempotency::{
    IdempotencyConfig, IdempotencyGuard, InMemoryIdemStore, NatsKvIdemStore, SharedIdemStore,
};
use wg_ratelimit::{HybridRateStore, RateLimiter};
use wg_store::{Store, TenantRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("wg-gateway");
    let config = GatewayConfig::from_env();

    let store = Store::open(&config.database_path)?;
    let registry = TenantRegistry::new(store.clone());

    let nats = async_nats::connect(&config.nats_url).await?;
    let js = async_nats::jetstream::new(nats.clone());

    let idem = init_guard(&js).await;
    let rate_store = HybridRateStore::new(Some(&js), &config.rate_kv_namespace).await?;
    let limiter = RateLimiter::new(rate_store);

    let bus = Arc::new(NatsBusClient::new(nats.clone()));
    let publisher: SharedEnqueuer = Arc::new(JetStreamEnqueuer::new(nats.clone()).await?);
    let enqueuer: SharedEnqueuer = Arc::new(DedupingEnqueuer::new(idem.clone(), publisher));

    let catalog = Arc::new(HttpCatalogClient::new(
        config.catalog_api_base.clone(),
        config.catalog_api_key.clone(),
    )?);
    let order_api = Arc::new(HttpOrderApi::new(
        config.order_api_base.clone(),
        config.order_api_key.clone(),
    )?);
    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        catalog,
        enqueuer.clone(),
        bus.clone(),
        order_api,
    ));

    spawn_invalidation_listener(&nats, registry.clone()).await;

    let state = AppState {
        store,
        registry,
        bus,
        idem,
        limiter,
        engine,
        enqueuer,
        config: Arc::new(config.clone()),
    };

    let app = build_router(state);
    let addr: std::net::SocketAddr = config.bind.parse()?;
    tracing::info!("wg-gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn init_guard(js: &async_nats::jetstream::Context) -> IdempotencyGuard {
    let cfg = IdempotencyConfig::from_env();
    let store: SharedIdemStore = match NatsKvIdemStore::new(js, &cfg.namespace).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::warn!(error = %err, "idempotency store unavailable, using in-memory fallback");
            Arc::new(InMemoryIdemStore::new())
        }
    };
    IdempotencyGuard::new(store, cfg.ttl_hours)
}

/// Admin writes on any process fan out `wa.admin.invalidate`; every gateway
/// drops its registry cache on receipt.
async fn spawn_invalidation_listener(nats: &async_nats::Client, registry: TenantRegistry) {
    match nats.subscribe(subjects::admin_invalidate()).await {
        Ok(mut sub) => {
            tokio::spawn(async move {
                while sub.next().await.is_some() {
                    registry.invalidate_all();
                }
            });
        }
        Err(err) => tracing::warn!(error = %err, "invalidation subscription failed"),
    }
}
