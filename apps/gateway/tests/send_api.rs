//! Send API, verification handshake, and bot toggle.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;
use wg_core::bus::InMemoryBusClient;
use wg_core::catalog::InMemoryCatalog;
use wg_core::testkit;
use wg_core::types::Tenant;
use wg_flow::{FlowEngine, InMemoryOrderApi, RecordingEnqueuer, SharedEnqueuer};
use wg_gateway::http::build_router;
use wg_gateway::outbound::DedupingEnqueuer;
use wg_gateway::{AppState, GatewayConfig};
use wg_idempotency::{IdempotencyGuard, InMemoryIdemStore};
use wg_ratelimit::{InMemoryRateStore, RateLimiter};
use wg_store::{Store, TenantRegistry};

struct Harness {
    state: AppState,
    recorder: RecordingEnqueuer,
    bus: InMemoryBusClient,
}

async fn harness(tenant: &Tenant) -> Harness {
    let store = Store::open_in_memory().unwrap();
    store
        .insert_tenant(wg_store::NewTenant::from_tenant(tenant))
        .await
        .unwrap();

    let recorder = RecordingEnqueuer::new();
    let idem = IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 24);
    let enqueuer: SharedEnqueuer = Arc::new(DedupingEnqueuer::new(
        idem.clone(),
        Arc::new(recorder.clone()),
    ));
    let bus = InMemoryBusClient::default();
    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        Arc::new(InMemoryCatalog::new()),
        enqueuer.clone(),
        Arc::new(bus.clone()),
        Arc::new(InMemoryOrderApi::new()),
    ));

    let state = AppState {
        store: store.clone(),
        registry: TenantRegistry::new(store),
        bus: Arc::new(bus.clone()),
        idem,
        limiter: RateLimiter::new(Arc::new(InMemoryRateStore::new())),
        engine,
        enqueuer,
        config: Arc::new(GatewayConfig::for_tests()),
    };

    Harness {
        state,
        recorder,
        bus,
    }
}

async fn post_json(
    state: &AppState,
    uri: &str,
    bearer: Option<&str>,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let app = build_router(state.clone());
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, parsed)
}

#[tokio::test]
async fn queues_send_with_canonical_phone() {
    let tenant = testkit::tenant("t1");
    let h = harness(&tenant).await;

    let (status, body) = post_json(
        &h.state,
        "/messages",
        Some("test-token"),
        json!({
            "phoneNumber": "0500000002",
            "text": "Order #42 ready",
            "fromNumber": "+966500000001",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert!(body["jobId"].as_str().is_some());

    let jobs = h.recorder.jobs().await;
    assert_eq!(jobs.len(), 1);
    // Local 05x form resolved against the default country code.
    assert_eq!(jobs[0].customer_wa.as_str(), "+966500000002");
    assert_eq!(jobs[0].body, "Order #42 ready");
}

#[tokio::test]
async fn identical_request_id_enqueues_once() {
    let tenant = testkit::tenant("t1");
    let h = harness(&tenant).await;

    for _ in 0..3 {
        let (status, _) = post_json(
            &h.state,
            "/messages",
            Some("test-token"),
            json!({
                "phoneNumber": "+966500000002",
                "text": "hello",
                "fromNumber": "+966500000001",
                "requestId": "req-1",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(h.recorder.jobs().await.len(), 1);
}

#[tokio::test]
async fn rejects_bad_bearer_and_unknown_tenant() {
    let tenant = testkit::tenant("t1");
    let h = harness(&tenant).await;

    let (status, _) = post_json(
        &h.state,
        "/messages",
        Some("wrong"),
        json!({ "phoneNumber": "+966500000002", "text": "x" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = post_json(
        &h.state,
        "/messages",
        Some("test-token"),
        json!({
            "phoneNumber": "+966500000002",
            "text": "x",
            "fromNumber": "+14150000000",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("+14150000000"));
}

#[tokio::test]
async fn inactive_tenant_is_403() {
    let tenant = testkit::tenant("t1");
    let h = harness(&tenant).await;
    h.state.registry.set_active("t1", false).await.unwrap();

    let (status, _) = post_json(
        &h.state,
        "/messages",
        Some("test-token"),
        json!({
            "phoneNumber": "+966500000002",
            "text": "x",
            "fromNumber": "+966500000001",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn quota_exhaustion_rejects_explicit_sends() {
    let mut tenant = testkit::tenant("t1");
    tenant.limits.monthly_conversations = 1;
    let h = harness(&tenant).await;

    let now = time::OffsetDateTime::now_utc();
    h.state.store.record_new_session("t1", 1, now).await.unwrap();
    h.state.store.record_new_session("t1", 1, now).await.unwrap();

    let (status, body) = post_json(
        &h.state,
        "/messages",
        Some("test-token"),
        json!({
            "phoneNumber": "+966500000002",
            "text": "x",
            "fromNumber": "+966500000001",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["limit"], 1);
    assert!(h.recorder.jobs().await.is_empty());
}

#[tokio::test]
async fn verification_handshake() {
    let tenant = testkit::tenant("t1");
    let h = harness(&tenant).await;
    let app = build_router(h.state.clone());

    let ok = Request::builder()
        .uri("/whatsapp/webhook?hub.mode=subscribe&hub.verify_token=test-verify&hub.challenge=12345")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(ok).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"12345");

    let bad = Request::builder()
        .uri("/whatsapp/webhook?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=12345")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bot_toggle_persists_and_publishes() {
    let tenant = testkit::tenant("t1");
    let h = harness(&tenant).await;

    let (status, body) = post_json(
        &h.state,
        "/bot/toggle",
        Some("test-token"),
        json!({ "enabled": false }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert!(!h.state.store.bot_enabled().await.unwrap());

    let events = h.bus.take_published().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "wa.evt.bot.status");
    assert_eq!(events[0].1["data"]["enabled"], false);
}
