//! Per-tenant event fan-out.
//!
//! The core only publishes; dashboard consumers subscribe out of process.
//! Delivery is at-least-once and ordered per publisher per channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::subjects;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Publish(#[from] anyhow::Error),
}

#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish_value(&self, subject: &str, payload: Value) -> Result<(), BusError>;
}

pub type SharedBus = Arc<dyn BusClient>;

pub struct NatsBusClient {
    client: async_nats::Client,
}

impl NatsBusClient {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BusClient for NatsBusClient {
    async fn publish_value(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        let bytes =
            serde_json::to_vec(&payload).map_err(|e| BusError::Publish(anyhow::Error::new(e)))?;
        self.client
            .publish(subject.to_string(), bytes.into())
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))
    }
}

/// Captures published events for assertions in tests.
#[derive(Clone, Default)]
pub struct InMemoryBusClient {
    published: Arc<Mutex<Vec<(String, Value)>>>,
}

impl InMemoryBusClient {
    pub async fn take_published(&self) -> Vec<(String, Value)> {
        let mut guard = self.published.lock().await;
        std::mem::take(&mut *guard)
    }
}

#[async_trait]
impl BusClient for InMemoryBusClient {
    async fn publish_value(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        let mut guard = self.published.lock().await;
        guard.push((subject.to_string(), payload));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.failed")]
    MessageFailed,
    #[serde(rename = "conversation.updated")]
    ConversationUpdated,
    #[serde(rename = "order.updated")]
    OrderUpdated,
    #[serde(rename = "bot.status")]
    BotStatus,
    #[serde(rename = "quota.exceeded")]
    QuotaExceeded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => "message.received",
            EventKind::MessageSent => "message.sent",
            EventKind::MessageFailed => "message.failed",
            EventKind::ConversationUpdated => "conversation.updated",
            EventKind::OrderUpdated => "order.updated",
            EventKind::BotStatus => "bot.status",
            EventKind::QuotaExceeded => "quota.exceeded",
        }
    }

    /// The channel this kind of event is published on.
    pub fn subject(&self, tenant: &str) -> String {
        match self {
            EventKind::MessageReceived | EventKind::MessageSent | EventKind::MessageFailed => {
                subjects::evt_msg(tenant)
            }
            EventKind::ConversationUpdated => subjects::evt_conv(tenant),
            EventKind::OrderUpdated => subjects::evt_order(tenant),
            EventKind::BotStatus => subjects::evt_bot_status(),
            EventKind::QuotaExceeded => subjects::evt_quota(tenant),
        }
    }
}

/// Wire envelope published on every event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, tenant_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.into(),
            data,
        }
    }
}

/// Publishes `event` on its canonical channel. Failures are logged, never
/// propagated: event fan-out must not fail the pipeline.
pub async fn emit(bus: &dyn BusClient, event: Event) {
    let subject = event.kind.subject(&event.tenant_id);
    let value = match serde_json::to_value(&event) {
        Ok(v) => v,
        Err(err) => {
            tracing::error!(error = %err, kind = event.kind.as_str(), "failed to serialize event");
            return;
        }
    };
    if let Err(err) = bus.publish_value(&subject, value).await {
        tracing::warn!(error = %err, subject = %subject, "event publish failed");
    }
}
