//! Job dispatch: FIFO lanes per conversation, capped in-flight per tenant
//! and globally, one retry policy for every send.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{error, info, warn};
use wg_core::bus::{emit, Event, EventKind, SharedBus};
use wg_core::provider::{ProviderError, SendOutcome, SharedProvider};
use wg_core::types::{
    Channel, MessageKind, OutboundJob, OutboundKind, TemplateDescriptor, TemplateIntent, Tenant,
};
use wg_dlq::{DlqError, SharedDlq};
use wg_ratelimit::{Bucket, RateLimiter};
use wg_store::{NewOutbound, Store, TenantRegistry};

use crate::backoff::{jittered, retry_delay};
use crate::bootstrap_sink::SharedBootstrapSink;
use crate::config::WorkerConfig;

const LANE_DEPTH: usize = 256;
const DLQ_STAGE: &str = "outbound";

struct LaneEntry {
    job: OutboundJob,
    done: oneshot::Sender<()>,
}

struct Inner {
    store: Store,
    registry: TenantRegistry,
    provider: SharedProvider,
    limiter: RateLimiter,
    bus: SharedBus,
    dlq: SharedDlq,
    bootstrap: SharedBootstrapSink,
    config: WorkerConfig,
    global_slots: Arc<Semaphore>,
    tenant_slots: DashMap<String, Arc<Semaphore>>,
    lanes: DashMap<String, mpsc::Sender<LaneEntry>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        registry: TenantRegistry,
        provider: SharedProvider,
        limiter: RateLimiter,
        bus: SharedBus,
        dlq: SharedDlq,
        bootstrap: SharedBootstrapSink,
        config: WorkerConfig,
    ) -> Self {
        let global_slots = Arc::new(Semaphore::new(config.global_concurrency));
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                provider,
                limiter,
                bus,
                dlq,
                bootstrap,
                config,
                global_slots,
                tenant_slots: DashMap::new(),
                lanes: DashMap::new(),
            }),
        }
    }

    /// Routes the job onto its conversation lane. The returned receiver
    /// resolves once the job reached a terminal outcome (sent or
    /// dead-lettered); callers ack the queue message then.
    pub async fn submit(&self, job: OutboundJob) -> oneshot::Receiver<()> {
        let key = format!("{}:{}", job.tenant_id, job.conversation_id);
        let (done, receiver) = oneshot::channel();
        let mut entry = LaneEntry { job, done };
        loop {
            let sender = self
                .inner
                .lanes
                .entry(key.clone())
                .or_insert_with(|| spawn_lane(Arc::clone(&self.inner)))
                .clone();
            match sender.send(entry).await {
                Ok(()) => return receiver,
                Err(mpsc::error::SendError(returned)) => {
                    // Lane task died; replace it and retry.
                    self.inner.lanes.remove(&key);
                    entry = returned;
                }
            }
        }
    }
}

fn spawn_lane(inner: Arc<Inner>) -> mpsc::Sender<LaneEntry> {
    let (sender, mut receiver) = mpsc::channel::<LaneEntry>(LANE_DEPTH);
    tokio::spawn(async move {
        while let Some(entry) = receiver.recv().await {
            let tenant_slots = inner.tenant_slot(&entry.job.tenant_id);
            let _tenant_permit = tenant_slots
                .acquire_owned()
                .await
                .expect("tenant semaphore never closes");
            let _global_permit = inner
                .global_slots
                .clone()
                .acquire_owned()
                .await
                .expect("global semaphore never closes");
            inner.process(entry.job).await;
            let _ = entry.done.send(());
        }
    });
    sender
}

impl Inner {
    fn tenant_slot(&self, tenant_id: &str) -> Arc<Semaphore> {
        self.tenant_slots
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.tenant_concurrency)))
            .clone()
    }

    async fn process(&self, job: OutboundJob) {
        let tenant = match self.registry.load(&job.tenant_id).await {
            Ok(t) => t,
            Err(err) => {
                error!(error = %err, tenant = %job.tenant_id, "tenant load failed");
                self.dead_letter(&job, 0, "E_TENANT", &err.to_string()).await;
                return;
            }
        };
        if !tenant.accepts_traffic() {
            self.dead_letter(&job, 0, "E_TENANT_INACTIVE", "tenant disabled").await;
            return;
        }

        // Pacing; denials wait out the window and never consume attempts.
        loop {
            match self
                .limiter
                .check(&Bucket::tenant_outbound(&tenant.id), tenant.limits.per_minute)
                .await
            {
                Ok(decision) if decision.is_allowed() => break,
                Ok(decision) => {
                    let delay = jittered(decision.retry_after());
                    info!(tenant = %tenant.id, delay_ms = delay.as_millis() as u64, "outbound paced");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(error = %err, "outbound pacing check failed; proceeding");
                    break;
                }
            }
        }

        let now = OffsetDateTime::now_utc();
        let channel = if job.force_freeform {
            Channel::Freeform
        } else {
            self.pick_channel(&tenant, &job, now).await
        };

        let mut attempt = job.attempt;
        loop {
            attempt += 1;
            match self.send_once(&tenant, &job, channel).await {
                Ok((outcome, descriptor)) => {
                    self.post_send(&tenant, &job, outcome, descriptor).await;
                    return;
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = retry_delay(self.config.base_backoff, attempt);
                    warn!(
                        tenant = %tenant.id,
                        request_id = %job.request_id,
                        attempt,
                        error = %err,
                        "send failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let code = if err.is_retryable() {
                        "E_RETRY_EXHAUSTED"
                    } else {
                        "E_TERMINAL"
                    };
                    self.dead_letter(&job, attempt, code, &err.to_string()).await;
                    emit(
                        self.bus.as_ref(),
                        Event::new(
                            EventKind::MessageFailed,
                            &tenant.id,
                            json!({
                                "requestId": job.request_id,
                                "conversationId": job.conversation_id,
                                "code": code,
                                "reason": err.to_string(),
                            }),
                        ),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// Freeform inside the 24h window, template outside it.
    async fn pick_channel(&self, tenant: &Tenant, job: &OutboundJob, now: OffsetDateTime) -> Channel {
        match self
            .store
            .window_open(&tenant.id, &job.customer_wa, now)
            .await
        {
            Ok(true) => Channel::Freeform,
            Ok(false) => Channel::Template,
            Err(err) => {
                // Template is the safe side: the provider accepts it either way.
                warn!(error = %err, "window check failed; using template");
                Channel::Template
            }
        }
    }

    async fn send_once(
        &self,
        tenant: &Tenant,
        job: &OutboundJob,
        channel: Channel,
    ) -> Result<(SendOutcome, Option<TemplateDescriptor>), ProviderError> {
        match channel {
            Channel::Freeform => self
                .provider
                .send_freeform(tenant, &job.customer_wa, &job.body, job.media_url.as_deref())
                .await
                .map(|outcome| (outcome, None)),
            Channel::Template => {
                let descriptor = match job.intent {
                    TemplateIntent::Welcome => tenant.welcome_template.clone(),
                    TemplateIntent::OrderUpdate => tenant.order_template.clone(),
                };
                let Some(descriptor) = descriptor else {
                    return Err(ProviderError::Terminal {
                        status: 0,
                        detail: "no approved template configured for tenant".into(),
                    });
                };
                let variables = job.template_variables.clone().unwrap_or_else(|| {
                    let mut vars = std::collections::BTreeMap::new();
                    vars.insert("1".to_string(), job.body.clone());
                    vars
                });
                self.provider
                    .send_template(tenant, &job.customer_wa, &descriptor, &variables)
                    .await
                    .map(|outcome| (outcome, Some(descriptor)))
            }
        }
    }

    /// Ordered post-send steps: persist the outbound row idempotently,
    /// publish `message.sent`, cache template payloads, trigger bootstrap
    /// after the first welcome.
    async fn post_send(
        &self,
        tenant: &Tenant,
        job: &OutboundJob,
        outcome: SendOutcome,
        descriptor: Option<TemplateDescriptor>,
    ) {
        let now = OffsetDateTime::now_utc();
        let kind = match (outcome.channel, job.kind) {
            (Channel::Template, _) => MessageKind::Template,
            (_, OutboundKind::Media) => MessageKind::Media,
            (_, OutboundKind::Text) => MessageKind::Text,
        };
        let stored = self
            .store
            .create_outbound(NewOutbound {
                conversation_id: job.conversation_id.clone(),
                tenant_id: tenant.id.clone(),
                provider_sid: outcome.sid.clone(),
                channel: outcome.channel,
                kind,
                body: job.body.clone(),
                template: descriptor.clone(),
                at: now,
            })
            .await;
        if let Err(err) = &stored {
            error!(error = %err, sid = %outcome.sid, "outbound row persist failed; scheduling reconcile");
        }

        metrics::counter!(
            "outbound_sent",
            "tenant" => tenant.id.clone(),
            "channel" => outcome.channel.as_str().to_string()
        )
        .increment(1);
        emit(
            self.bus.as_ref(),
            Event::new(
                EventKind::MessageSent,
                &tenant.id,
                json!({
                    "providerId": outcome.sid,
                    "conversationId": job.conversation_id,
                    "channel": outcome.channel.as_str(),
                    "template": descriptor.as_ref().map(|d| d.friendly_name.clone()),
                    "body": job.body,
                }),
            ),
        )
        .await;

        if outcome.channel == Channel::Template && job.intent == TemplateIntent::OrderUpdate {
            if let Some(descriptor) = &descriptor {
                if let Err(err) = self
                    .store
                    .cache_template_payload(
                        &tenant.id,
                        &job.customer_wa,
                        &descriptor.sid,
                        &job.body,
                        now,
                    )
                    .await
                {
                    error!(error = %err, "template payload cache failed");
                }
            }
        }

        if job.intent == TemplateIntent::Welcome {
            let bootstrap = wg_core::types::BootstrapJob {
                tenant_id: tenant.id.clone(),
                conversation_id: job.conversation_id.clone(),
                customer_wa: job.customer_wa.clone(),
            };
            if let Err(err) = self.bootstrap.enqueue(bootstrap).await {
                warn!(error = %err, "bootstrap enqueue failed");
            }
        }
    }

    async fn dead_letter(&self, job: &OutboundJob, attempts: u32, code: &str, message: &str) {
        let record = match wg_dlq::record(
            &job.tenant_id,
            DLQ_STAGE,
            &job.request_id,
            attempts,
            DlqError {
                code: code.to_string(),
                message: message.to_string(),
            },
            job,
        ) {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "dead-letter record build failed");
                return;
            }
        };
        if let Err(err) = self.dlq.publish(record).await {
            error!(error = %err, request_id = %job.request_id, "dead-letter publish failed");
        }
    }
}
