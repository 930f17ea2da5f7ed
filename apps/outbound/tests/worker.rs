//! Dispatcher semantics: FIFO per conversation, caps, retries, channel
//! selection, dead letters, bootstrap trigger.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use wg_core::bus::InMemoryBusClient;
use wg_core::provider::{
    ProviderClient, ProviderError, RecordingProvider, SendOutcome, SharedProvider,
};
use wg_core::testkit;
use wg_core::phone::PhoneNumber;
use wg_core::types::{
    Channel, MessageKind, OutboundJob, TemplateDescriptor, TemplateIntent, Tenant,
};
use wg_dlq::InMemoryDlq;
use wg_outbound::{Dispatcher, InMemoryBootstrapSink, WorkerConfig};
use wg_ratelimit::{InMemoryRateStore, RateLimiter};
use wg_store::{NewInbound, Store, TenantRegistry};

struct Harness {
    store: Store,
    tenant: Tenant,
    provider: Arc<RecordingProvider>,
    dlq: InMemoryDlq,
    bus: InMemoryBusClient,
    bootstrap: InMemoryBootstrapSink,
    dispatcher: Dispatcher,
}

async fn harness() -> Harness {
    harness_with_provider_and_limiter(None, None).await
}

async fn harness_with_provider_and_limiter(
    provider: Option<SharedProvider>,
    limiter: Option<RateLimiter>,
) -> Harness {
    let store = Store::open_in_memory().unwrap();
    let tenant = testkit::tenant("t1");
    store
        .insert_tenant(wg_store::NewTenant::from_tenant(&tenant))
        .await
        .unwrap();

    let recording = Arc::new(RecordingProvider::new());
    let provider: SharedProvider = provider.unwrap_or_else(|| recording.clone());
    let limiter =
        limiter.unwrap_or_else(|| RateLimiter::new(Arc::new(InMemoryRateStore::new())));
    let dlq = InMemoryDlq::default();
    let bus = InMemoryBusClient::default();
    let bootstrap = InMemoryBootstrapSink::default();

    let dispatcher = Dispatcher::new(
        store.clone(),
        TenantRegistry::new(store.clone()),
        provider,
        limiter,
        Arc::new(bus.clone()),
        Arc::new(dlq.clone()),
        Arc::new(bootstrap.clone()),
        WorkerConfig::for_tests(),
    );

    Harness {
        store,
        tenant,
        provider: recording,
        dlq,
        bus,
        bootstrap,
        dispatcher,
    }
}

async fn conversation(h: &Harness, customer: &PhoneNumber) -> String {
    h.store
        .upsert_conversation("t1", customer, OffsetDateTime::now_utc())
        .await
        .unwrap()
        .id
}

/// Opens the messaging window for this customer.
async fn inbound(h: &Harness, conversation_id: &str, sid: &str) {
    h.store
        .create_inbound(NewInbound {
            conversation_id: conversation_id.to_string(),
            tenant_id: "t1".into(),
            provider_sid: sid.to_string(),
            kind: MessageKind::Text,
            body: "hi".into(),
            media_url: None,
            metadata: serde_json::json!({}),
            at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
}

fn job(h: &Harness, conversation_id: &str, customer: &PhoneNumber, body: &str) -> OutboundJob {
    OutboundJob::text(
        "t1",
        conversation_id,
        customer.clone(),
        h.tenant.wa_number.clone(),
        body,
    )
}

#[tokio::test]
async fn fifo_is_preserved_per_conversation() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;
    inbound(&h, &conv, "M-window").await;

    let mut receivers = Vec::new();
    for i in 1..=20 {
        receivers.push(h.dispatcher.submit(job(&h, &conv, &customer, &format!("m{i}"))).await);
    }
    for receiver in receivers {
        receiver.await.unwrap();
    }

    let sends = h.provider.sends().await;
    let bodies: Vec<String> = sends.iter().map(|s| s.body.clone()).collect();
    let expected: Vec<String> = (1..=20).map(|i| format!("m{i}")).collect();
    assert_eq!(bodies, expected);
    assert!(sends.iter().all(|s| s.channel == Channel::Freeform));
}

struct GaugedProvider {
    current: AtomicI32,
    peak: AtomicI32,
}

impl GaugedProvider {
    fn new() -> Self {
        Self {
            current: AtomicI32::new(0),
            peak: AtomicI32::new(0),
        }
    }

    async fn track(&self) -> SendOutcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        SendOutcome {
            sid: wg_core::types::new_id(),
            channel: Channel::Freeform,
        }
    }
}

#[async_trait]
impl ProviderClient for GaugedProvider {
    async fn send_freeform(
        &self,
        _tenant: &Tenant,
        _to: &PhoneNumber,
        _body: &str,
        _media_url: Option<&str>,
    ) -> Result<SendOutcome, ProviderError> {
        Ok(self.track().await)
    }

    async fn send_template(
        &self,
        _tenant: &Tenant,
        _to: &PhoneNumber,
        _descriptor: &TemplateDescriptor,
        _variables: &BTreeMap<String, String>,
    ) -> Result<SendOutcome, ProviderError> {
        Ok(self.track().await)
    }
}

#[tokio::test]
async fn tenant_in_flight_cap_is_five() {
    let gauged = Arc::new(GaugedProvider::new());
    let h = harness_with_provider_and_limiter(Some(gauged.clone()), None).await;

    // 20 conversations dispatch in parallel but never more than 5 at once.
    let mut receivers = Vec::new();
    for i in 0..20 {
        let customer = testkit::phone(&format!("+2010000000{i:02}"));
        let conv = conversation(&h, &customer).await;
        inbound(&h, &conv, &format!("M-{i}")).await;
        receivers.push(h.dispatcher.submit(job(&h, &conv, &customer, "hello")).await);
    }
    for receiver in receivers {
        receiver.await.unwrap();
    }

    assert!(gauged.peak.load(Ordering::SeqCst) <= 5);
    assert!(gauged.peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;
    inbound(&h, &conv, "M-w").await;

    for _ in 0..2 {
        h.provider
            .push_failure(ProviderError::Retryable {
                status: 503,
                detail: "unavailable".into(),
            })
            .await;
    }

    h.dispatcher
        .submit(job(&h, &conv, &customer, "retry me"))
        .await
        .await
        .unwrap();

    assert_eq!(h.provider.sends().await.len(), 1);
    assert!(h.dlq.take().await.is_empty());
}

#[tokio::test]
async fn retry_budget_exhaustion_dead_letters() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;
    inbound(&h, &conv, "M-w").await;

    for _ in 0..3 {
        h.provider
            .push_failure(ProviderError::Retryable {
                status: 500,
                detail: "boom".into(),
            })
            .await;
    }

    h.dispatcher
        .submit(job(&h, &conv, &customer, "doomed"))
        .await
        .await
        .unwrap();

    assert!(h.provider.sends().await.is_empty());
    let dead = h.dlq.take().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].error.code, "E_RETRY_EXHAUSTED");

    let events = h.bus.take_published().await;
    assert!(events.iter().any(|(_, v)| v["type"] == "message.failed"));
}

#[tokio::test]
async fn terminal_failure_dead_letters_immediately() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;
    inbound(&h, &conv, "M-w").await;

    h.provider
        .push_failure(ProviderError::Terminal {
            status: 400,
            detail: "invalid recipient".into(),
        })
        .await;

    h.dispatcher
        .submit(job(&h, &conv, &customer, "bad"))
        .await
        .await
        .unwrap();

    let dead = h.dlq.take().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].error.code, "E_TERMINAL");
}

#[tokio::test]
async fn closed_window_falls_back_to_template_and_caches() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;
    // No inbound: the window is closed.

    h.dispatcher
        .submit(job(&h, &conv, &customer, "Order #42 ready"))
        .await
        .await
        .unwrap();

    let sends = h.provider.sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].channel, Channel::Template);
    assert_eq!(sends[0].template_sid.as_deref(), Some("HXorder"));

    // The payload is retrievable on button click, marked delivered once.
    let cached = h
        .store
        .consume_cached_payload("t1", &customer, OffsetDateTime::now_utc())
        .await
        .unwrap()
        .expect("cached payload");
    assert_eq!(cached.payload, "Order #42 ready");

    // The persisted outbound row carries both sid and friendly name.
    let events = h.bus.take_published().await;
    let sent = events
        .iter()
        .find(|(_, v)| v["type"] == "message.sent")
        .unwrap();
    assert_eq!(sent.1["data"]["template"], "order_update");
    assert_eq!(sent.1["data"]["channel"], "template");
}

#[tokio::test]
async fn force_freeform_bypasses_window() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;

    let mut forced = job(&h, &conv, &customer, "Order #42 ready");
    forced.force_freeform = true;
    h.dispatcher.submit(forced).await.await.unwrap();

    let sends = h.provider.sends().await;
    assert_eq!(sends[0].channel, Channel::Freeform);
}

#[tokio::test]
async fn welcome_send_triggers_bootstrap() {
    let h = harness().await;
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;
    inbound(&h, &conv, "M-w").await;

    let mut welcome = job(&h, &conv, &customer, "أهلاً");
    welcome.intent = TemplateIntent::Welcome;
    let mut vars = BTreeMap::new();
    vars.insert("1".to_string(), "أحمد".to_string());
    vars.insert("2".to_string(), h.tenant.name.clone());
    welcome.template_variables = Some(vars);

    h.dispatcher.submit(welcome).await.await.unwrap();

    let jobs = h.bootstrap.take().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].tenant_id, "t1");
    assert_eq!(jobs[0].customer_wa, customer);
}

#[tokio::test]
async fn pacing_delays_but_never_consumes_attempts() {
    let store = Arc::new(InMemoryRateStore::new());
    let limiter = RateLimiter::with_window(store, Duration::from_millis(150));
    let h = harness_with_provider_and_limiter(None, Some(limiter)).await;
    let mut limits = h.tenant.limits;
    limits.per_minute = 1;
    h.store.update_tenant_limits("t1", limits).await.unwrap();
    let customer = testkit::phone("+201000000001");
    let conv = conversation(&h, &customer).await;
    inbound(&h, &conv, "M-w").await;

    let started = std::time::Instant::now();
    let first = h.dispatcher.submit(job(&h, &conv, &customer, "a")).await;
    let second = h.dispatcher.submit(job(&h, &conv, &customer, "b")).await;
    first.await.unwrap();
    second.await.unwrap();

    // Both sent, in order, with the second paced into the next window.
    let sends = h.provider.sends().await;
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0].body, "a");
    assert_eq!(sends[1].body, "b");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(h.dlq.take().await.is_empty());
}
