//! Distributed idempotency locks backed by NATS JetStream key-value buckets.
//!
//! The webhook pipeline takes a lock per provider message sid before any
//! side effect; the outbound enqueue path takes one per request id. The
//! durable unique constraint on `messages.provider_sid` is the second line
//! of defence when the fast store is unavailable.

use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::Duration as StdDuration,
};

use anyhow::{Context, Result};
use async_nats::jetstream::{
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind},
    Context as JsContext,
};
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

/// Default TTL for inbound-message locks.
pub const INBOUND_TTL_HOURS: u64 = 24;

/// Key shapes accepted by the guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdemKey {
    /// Provider message sid of an inbound webhook.
    Msg(String),
    /// Deterministic request id of an outbound enqueue.
    Job(String),
}

impl Display for IdemKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IdemKey::Msg(sid) => write!(f, "msg:{sid}"),
            IdemKey::Job(id) => write!(f, "job:{id}"),
        }
    }
}

/// Contract implemented by idempotency stores: atomic set-if-absent with TTL.
#[async_trait]
pub trait IdemStore: Send + Sync {
    /// Returns `Ok(true)` when the key did not previously exist (caller
    /// should continue), `Ok(false)` for a duplicate.
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

pub type SharedIdemStore = Arc<dyn IdemStore>;

/// In-memory store for tests and single-process fallback.
#[derive(Clone, Default)]
pub struct InMemoryIdemStore {
    inner: Arc<RwLock<std::collections::HashMap<String, OffsetDateTime>>>,
}

impl InMemoryIdemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) {
        let mut guard = self.inner.write().await;
        guard.retain(|_, expires| *expires > now);
    }
}

#[async_trait]
impl IdemStore for InMemoryIdemStore {
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool> {
        let ttl = Duration::seconds(ttl_s as i64);
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        match guard.get(key) {
            Some(exp) if *exp > now => Ok(false),
            _ => {
                guard.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        let guard = self.inner.read().await;
        Ok(matches!(guard.get(key), Some(exp) if *exp > now))
    }
}

/// JetStream-backed store shared across gateway processes.
pub struct NatsKvIdemStore {
    bucket: kv::Store,
}

impl NatsKvIdemStore {
    /// Ensures the KV bucket exists (or creates it) and returns a handle.
    pub async fn new(js: &JsContext, namespace: &str) -> Result<Self> {
        let bucket = match js.get_key_value(namespace).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(kv::Config {
                    bucket: namespace.to_string(),
                    history: 1,
                    max_age: StdDuration::from_secs(0),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("create JetStream KV bucket {namespace}"))?,
            Err(err) => anyhow::bail!("idempotency kv init failed: {err}"),
        };
        Ok(Self { bucket })
    }
}

#[async_trait]
impl IdemStore for NatsKvIdemStore {
    #[instrument(name = "idempotency.put_if_absent", skip(self), fields(key = %key))]
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool> {
        let ttl = StdDuration::from_secs(ttl_s.max(1));
        let seen_at = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        let payload = serde_json::to_vec(&serde_json::json!({ "seen_at": seen_at }))?;

        match self.bucket.create_with_ttl(key, payload.into(), ttl).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(anyhow::anyhow!(err)
                .context(format!("put idempotency key {key} with ttl {ttl_s}s"))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.bucket.entry(key).await?.is_some())
    }
}

#[derive(Clone)]
pub struct IdempotencyConfig {
    pub ttl_hours: u64,
    pub namespace: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_hours: INBOUND_TTL_HOURS,
            namespace: "wa-idempotency".to_string(),
        }
    }
}

impl IdempotencyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(ttl) = std::env::var("IDEMPOTENCY_TTL_HOURS") {
            if let Ok(parsed) = ttl.parse::<u64>() {
                cfg.ttl_hours = parsed.max(1);
            }
        }
        if let Ok(ns) = std::env::var("IDEMPOTENCY_KV_NAMESPACE") {
            if !ns.trim().is_empty() {
                cfg.namespace = ns;
            }
        }
        cfg
    }
}

/// Guard used by the pipeline and the enqueue path.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ttl_secs: u64,
    store: SharedIdemStore,
}

impl IdempotencyGuard {
    pub fn new(store: SharedIdemStore, ttl_hours: u64) -> Self {
        Self {
            store,
            ttl_secs: ttl_hours.saturating_mul(3600).max(60),
        }
    }

    /// Returns `Ok(true)` on the first sighting of `key`.
    pub async fn try_acquire(&self, key: &IdemKey) -> Result<bool> {
        let inserted = self
            .store
            .put_if_absent(&key.to_string(), self.ttl_secs)
            .await?;
        if !inserted {
            warn!(key = %key, "duplicate dropped");
            metrics::counter!("idempotency_hit").increment(1);
        }
        Ok(inserted)
    }

    pub async fn exists(&self, key: &IdemKey) -> Result<bool> {
        self.store.exists(&key.to_string()).await
    }
}
