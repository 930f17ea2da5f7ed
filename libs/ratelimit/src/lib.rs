//! Fixed-window rate counters shared across gateway processes.
//!
//! Buckets are plain string keys; the first increment of a window creates it
//! with a TTL, subsequent increments bump the shared counter. A denial
//! carries the window remainder so callers can surface `Retry-After` or
//! requeue with a delay.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration as StdDuration, Instant},
};

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind, UpdateErrorKind},
    Context as JsContext,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{serde::rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::warn;

/// All spec'd buckets share a one-minute window.
pub const WINDOW: StdDuration = StdDuration::from_secs(60);

const CAS_RETRIES: usize = 8;

/// A counter key. Constructors cover every scope the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bucket(String);

impl Bucket {
    pub fn global_webhook() -> Self {
        Bucket("global:webhook".into())
    }

    pub fn tenant_inbound(tenant_id: &str) -> Self {
        Bucket(format!("tenant:{tenant_id}:inbound"))
    }

    pub fn tenant_outbound(tenant_id: &str) -> Self {
        Bucket(format!("tenant:{tenant_id}:outbound"))
    }

    pub fn customer(tenant_id: &str, customer: &str) -> Self {
        Bucket(format!("customer:{tenant_id}:{customer}"))
    }

    pub fn bootstrap(tenant_id: &str) -> Self {
        Bucket(format!("tenant:{tenant_id}:bootstrap"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of a counter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied { retry_after: StdDuration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Window remainder for denied checks, zero otherwise.
    pub fn retry_after(&self) -> StdDuration {
        match self {
            Decision::Allowed { .. } => StdDuration::ZERO,
            Decision::Denied { retry_after } => *retry_after,
        }
    }
}

/// Atomic increment-with-window storage.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Increments the bucket's current window counter (creating the window
    /// on first increment) and returns the post-increment count plus the
    /// time left in the window.
    async fn incr(&self, key: &str, window: StdDuration) -> Result<(u64, StdDuration)>;
}

pub type SharedRateStore = Arc<dyn RateStore>;

/// Single-process store for tests and local fallback.
#[derive(Clone, Default)]
pub struct InMemoryRateStore {
    windows: Arc<Mutex<HashMap<String, (u64, Instant)>>>,
}

impl InMemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for InMemoryRateStore {
    async fn incr(&self, key: &str, window: StdDuration) -> Result<(u64, StdDuration)> {
        let now = Instant::now();
        let mut guard = self.windows.lock().await;
        let entry = guard.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= window {
            *entry = (0, now);
        }
        entry.0 += 1;
        let elapsed = now.duration_since(entry.1);
        Ok((entry.0, window.saturating_sub(elapsed)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedWindow {
    count: u64,
    #[serde(with = "rfc3339")]
    started_at: OffsetDateTime,
}

/// JetStream KV store: one entry per bucket, replaced by compare-and-swap,
/// expired by the bucket TTL.
pub struct NatsKvRateStore {
    bucket: kv::Store,
}

impl NatsKvRateStore {
    pub async fn new(js: &JsContext, namespace: &str) -> Result<Self> {
        let bucket = match js.get_key_value(namespace).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(kv::Config {
                    bucket: namespace.to_string(),
                    description: "fixed-window rate counters".into(),
                    history: 1,
                    max_age: StdDuration::from_secs(0),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("create JetStream KV bucket {namespace}"))?,
            Err(err) => return Err(anyhow!(err).context("initializing rate-limit bucket")),
        };
        Ok(Self { bucket })
    }
}

#[async_trait]
impl RateStore for NatsKvRateStore {
    async fn incr(&self, key: &str, window: StdDuration) -> Result<(u64, StdDuration)> {
        let kv_key = sanitize_key(key);
        let mut retries = 0usize;
        loop {
            let entry = self
                .bucket
                .entry(kv_key.as_str())
                .await
                .with_context(|| format!("load rate window {key}"))?;
            let now = OffsetDateTime::now_utc();

            let state = entry
                .as_ref()
                .and_then(|e| serde_json::from_slice::<PersistedWindow>(e.value.as_ref()).ok());
            let (count, started_at) = match state {
                Some(w) if window_is_live(w.started_at, now, window) => (w.count, w.started_at),
                _ => (0, now),
            };

            let next = PersistedWindow {
                count: count + 1,
                started_at,
            };
            let payload = serde_json::to_vec(&next)?;
            let elapsed = (now - started_at).unsigned_abs();
            let remaining = window.saturating_sub(elapsed);

            let result = match &entry {
                Some(e) => self
                    .bucket
                    .update(kv_key.as_str(), payload.into(), e.revision)
                    .await
                    .map(|_| ())
                    .map_err(|err| match err.kind() {
                        UpdateErrorKind::WrongLastRevision => RaceOrFail::Race,
                        _ => RaceOrFail::Fail(anyhow!(err)),
                    }),
                None => self
                    .bucket
                    .create_with_ttl(kv_key.as_str(), payload.into(), window)
                    .await
                    .map(|_| ())
                    .map_err(|err| match err.kind() {
                        CreateErrorKind::AlreadyExists => RaceOrFail::Race,
                        _ => RaceOrFail::Fail(anyhow!(err)),
                    }),
            };

            match result {
                Ok(()) => return Ok((next.count, remaining)),
                Err(RaceOrFail::Race) => {
                    retries += 1;
                    if retries > CAS_RETRIES {
                        return Err(anyhow!("rate counter cas retries exhausted for {key}"));
                    }
                    continue;
                }
                Err(RaceOrFail::Fail(err)) => {
                    return Err(err.context(format!("persist rate window {key}")));
                }
            }
        }
    }
}

enum RaceOrFail {
    Race,
    Fail(anyhow::Error),
}

fn window_is_live(started_at: OffsetDateTime, now: OffsetDateTime, window: StdDuration) -> bool {
    let elapsed = now - started_at;
    elapsed >= time::Duration::ZERO && elapsed.unsigned_abs() < window
}

/// KV keys may not contain `:` separators; the readable bucket names keep
/// them for logs only.
fn sanitize_key(key: &str) -> String {
    key.replace([':', '+', ' '], ".")
}

/// Remote store with local fallback after a remote failure (the limiter must
/// degrade, never block ingestion).
pub struct HybridRateStore {
    remote: Option<NatsKvRateStore>,
    local: InMemoryRateStore,
    remote_failed: AtomicBool,
}

impl HybridRateStore {
    pub async fn new(js: Option<&JsContext>, namespace: &str) -> Result<Arc<Self>> {
        let remote = match js {
            Some(ctx) => match NatsKvRateStore::new(ctx, namespace).await {
                Ok(store) => Some(store),
                Err(err) => {
                    warn!(error = %err, "remote rate store unavailable, using local counters");
                    None
                }
            },
            None => None,
        };
        Ok(Arc::new(Self {
            remote,
            local: InMemoryRateStore::new(),
            remote_failed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl RateStore for HybridRateStore {
    async fn incr(&self, key: &str, window: StdDuration) -> Result<(u64, StdDuration)> {
        if let Some(remote) = &self.remote {
            match remote.incr(key, window).await {
                Ok(out) => {
                    self.remote_failed.store(false, Ordering::Release);
                    return Ok(out);
                }
                Err(err) => {
                    if !self.remote_failed.swap(true, Ordering::AcqRel) {
                        warn!(error = %err, "remote rate store failed, switching to local fallback");
                    }
                }
            }
        }
        self.local.incr(key, window).await
    }
}

/// Checks counters against configured limits.
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedRateStore,
    window: StdDuration,
}

impl RateLimiter {
    pub fn new(store: SharedRateStore) -> Self {
        Self {
            store,
            window: WINDOW,
        }
    }

    /// Narrow windows for tests.
    pub fn with_window(store: SharedRateStore, window: StdDuration) -> Self {
        Self { store, window }
    }

    /// Atomically consumes one slot from `bucket`. A `limit` of zero means
    /// the bucket is unmetered.
    pub async fn check(&self, bucket: &Bucket, limit: u32) -> Result<Decision> {
        if limit == 0 {
            return Ok(Decision::Allowed { remaining: u32::MAX });
        }
        let (count, remaining_window) = self.store.incr(bucket.as_str(), self.window).await?;
        if count <= u64::from(limit) {
            Ok(Decision::Allowed {
                remaining: limit - count as u32,
            })
        } else {
            metrics::counter!("rate_limited", "bucket" => bucket.as_str().to_string())
                .increment(1);
            Ok(Decision::Denied {
                retry_after: remaining_window,
            })
        }
    }
}
