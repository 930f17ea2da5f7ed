//! Pipeline tests driven through the axum router with in-memory stores.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use wg_core::bus::InMemoryBusClient;
use wg_core::catalog::{InMemoryCatalog, MenuCategory};
use wg_core::provider::compute_signature;
use wg_core::testkit;
use wg_core::types::{TemplateIntent, Tenant};
use wg_flow::{FlowEngine, InMemoryOrderApi, RecordingEnqueuer, SharedEnqueuer};
use wg_gateway::http::build_router;
use wg_gateway::outbound::DedupingEnqueuer;
use wg_gateway::{AppState, GatewayConfig};
use wg_idempotency::{IdempotencyGuard, InMemoryIdemStore};
use wg_ratelimit::{InMemoryRateStore, RateLimiter};
use wg_store::{Store, TenantRegistry};

struct Harness {
    state: AppState,
    tenant: Tenant,
    recorder: RecordingEnqueuer,
    bus: InMemoryBusClient,
}

async fn harness() -> Harness {
    harness_with(testkit::tenant("t1")).await
}

async fn harness_with(tenant: Tenant) -> Harness {
    let store = Store::open_in_memory().unwrap();
    store
        .insert_tenant(wg_store::NewTenant::from_tenant(&tenant))
        .await
        .unwrap();

    let recorder = RecordingEnqueuer::new();
    let idem = IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 24);
    let enqueuer: SharedEnqueuer = Arc::new(DedupingEnqueuer::new(
        idem.clone(),
        Arc::new(recorder.clone()),
    ));
    let bus = InMemoryBusClient::default();

    let catalog = Arc::new(InMemoryCatalog::new());
    catalog
        .put_categories(
            tenant.merchant_id.as_deref().unwrap(),
            vec![MenuCategory {
                id: "cat_1".into(),
                name: "برجر".into(),
            }],
        )
        .await;

    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        catalog,
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
        tenant,
        recorder,
        bus,
    }
}

fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

async fn post_webhook(state: &AppState, pairs: &[(&str, &str)]) -> (StatusCode, serde_json::Value) {
    post_webhook_signed(state, pairs, None).await
}

async fn post_webhook_signed(
    state: &AppState,
    pairs: &[(&str, &str)],
    signature: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let app = build_router(state.clone());
    let mut builder = Request::builder()
        .method("POST")
        .uri("/whatsapp/webhook")
        .header("content-type", "application/x-www-form-urlencoded");
    if let Some(sig) = signature {
        builder = builder.header("X-Twilio-Signature", sig);
    }
    let request = builder.body(Body::from(form_body(pairs))).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

fn hi(sid: &str) -> Vec<(&'static str, String)> {
    vec![
        ("From", "whatsapp:+201000000001".to_string()),
        ("To", "whatsapp:+966500000001".to_string()),
        ("MessageSid", sid.to_string()),
        ("Body", "hi".to_string()),
        ("ProfileName", "Ahmed".to_string()),
    ]
}

fn as_refs<'a>(pairs: &'a [(&'static str, String)]) -> Vec<(&'a str, &'a str)> {
    pairs.iter().map(|(k, v)| (*k, v.as_str())).collect()
}

#[tokio::test]
async fn welcome_flow_first_contact() {
    let h = harness().await;
    let pairs = hi("M1");
    let (status, body) = post_webhook(&h.state, &as_refs(&pairs)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");

    // Conversation + message persisted.
    let conv = h
        .state
        .store
        .conversation_by_customer("t1", &testkit::phone("+201000000001"))
        .await
        .unwrap()
        .expect("conversation created");
    assert_eq!(conv.unread_count, 1);

    // Welcome job enqueued with template variables.
    let jobs = h.recorder.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].intent, TemplateIntent::Welcome);

    // Events fanned out on the tenant channels.
    let events = h.bus.take_published().await;
    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|(_, v)| v["type"].as_str())
        .collect();
    assert!(kinds.contains(&"message.received"));
    assert!(kinds.contains(&"conversation.updated"));
}

#[tokio::test]
async fn provider_retry_is_idempotent() {
    let h = harness().await;
    let pairs = hi("M2");

    let (first, _) = post_webhook(&h.state, &as_refs(&pairs)).await;
    let (second, body) = post_webhook(&h.state, &as_refs(&pairs)).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");

    // Exactly one message row and one dispatched side effect.
    let conv = h
        .state
        .store
        .conversation_by_customer("t1", &testkit::phone("+201000000001"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.unread_count, 1);
    assert_eq!(h.recorder.jobs().await.len(), 1);
}

#[tokio::test]
async fn customer_rate_limit_returns_429() {
    let h = harness().await;
    let mut denied = 0;
    for i in 0..25 {
        let sid = format!("M-rate-{i}");
        let pairs = vec![
            ("From", "whatsapp:+201000000001".to_string()),
            ("To", "whatsapp:+966500000001".to_string()),
            ("MessageSid", sid),
            ("Body", "hi".to_string()),
        ];
        let (status, body) = post_webhook(&h.state, &as_refs(&pairs)).await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            denied += 1;
            assert!(body["retryAfter"].as_u64().is_some());
        }
    }
    assert_eq!(denied, 5);
    // No dispatch for denied messages: one welcome + 19 re-prompts.
    assert_eq!(h.recorder.jobs().await.len(), 20);
}

#[tokio::test]
async fn unknown_destination_is_404() {
    let h = harness().await;
    let pairs = vec![
        ("From", "whatsapp:+201000000001".to_string()),
        ("To", "whatsapp:+14150000000".to_string()),
        ("MessageSid", "M-404".to_string()),
        ("Body", "hi".to_string()),
    ];
    let (status, _) = post_webhook(&h.state, &as_refs(&pairs)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn inactive_tenant_drops_silently() {
    let h = harness().await;
    h.state.registry.set_active("t1", false).await.unwrap();

    let pairs = hi("M-inactive");
    let (status, body) = post_webhook(&h.state, &as_refs(&pairs)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dropped");
    assert!(h
        .state
        .store
        .conversation_by_customer("t1", &testkit::phone("+201000000001"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn non_form_body_is_415() {
    let h = harness().await;
    let app = build_router(h.state.clone());
    let request = Request::builder()
        .method("POST")
        .uri("/whatsapp/webhook")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn signature_is_enforced_when_required() {
    let mut tenant = testkit::tenant("t1");
    tenant.require_signature = true;
    let h = harness_with(tenant.clone()).await;

    let pairs = hi("M-sig");
    let (status, _) = post_webhook(&h.state, &as_refs(&pairs)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A correctly signed retry passes.
    let params: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    let sig = compute_signature(
        &tenant.auth_token,
        &h.state.config.webhook_public_url,
        &params,
    );
    let (status, body) = post_webhook_signed(&h.state, &as_refs(&pairs), Some(&sig)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
}

#[tokio::test]
async fn quota_overflow_suppresses_automation_and_publishes() {
    let mut tenant = testkit::tenant("t1");
    tenant.limits.monthly_conversations = 1;
    let h = harness_with(tenant).await;

    let first = hi("M-q1");
    post_webhook(&h.state, &as_refs(&first)).await;
    assert_eq!(h.recorder.jobs().await.len(), 1);
    h.bus.take_published().await;

    // A different customer opens the session that busts the quota.
    let second = vec![
        ("From", "whatsapp:+201000000002".to_string()),
        ("To", "whatsapp:+966500000001".to_string()),
        ("MessageSid", "M-q2".to_string()),
        ("Body", "hi".to_string()),
    ];
    let (status, body) = post_webhook(&h.state, &as_refs(&second)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");

    // Inbound persisted, automation suppressed, quota event published.
    assert!(h
        .state
        .store
        .conversation_by_customer("t1", &testkit::phone("+201000000002"))
        .await
        .unwrap()
        .is_some());
    assert_eq!(h.recorder.jobs().await.len(), 1);
    let events = h.bus.take_published().await;
    assert!(events
        .iter()
        .any(|(_, v)| v["type"] == "quota.exceeded"));
}

#[tokio::test]
async fn button_click_consumes_cached_payload() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let now = time::OffsetDateTime::now_utc();
    h.state
        .store
        .upsert_conversation("t1", &customer, now)
        .await
        .unwrap();
    h.state
        .store
        .cache_template_payload("t1", &customer, "HXorder", "Order #42 ready", now)
        .await
        .unwrap();

    let pairs = vec![
        ("From", "whatsapp:+201000000001".to_string()),
        ("To", "whatsapp:+966500000001".to_string()),
        ("MessageSid", "M-btn".to_string()),
        ("Body", "عرض الطلب".to_string()),
        ("ButtonPayload", "view_order".to_string()),
        ("ButtonText", "عرض الطلب".to_string()),
    ];
    let (status, _) = post_webhook(&h.state, &as_refs(&pairs)).await;
    assert_eq!(status, StatusCode::OK);

    let jobs = h.recorder.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].body, "Order #42 ready");
    assert!(jobs[0].force_freeform);
}
