//! Environment configuration for the outbound worker.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub database_path: String,
    pub nats_url: String,
    pub provider_api_base: String,
    pub rate_kv_namespace: String,
    /// In-flight cap per tenant.
    pub tenant_concurrency: usize,
    /// In-flight cap across the worker.
    pub global_concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: var_or("DATABASE_PATH", "wagate.db"),
            nats_url: var_or("NATS_URL", "nats://127.0.0.1:4222"),
            provider_api_base: var_or("PROVIDER_API_BASE", "https://api.twilio.com"),
            rate_kv_namespace: var_or("RATE_KV_NAMESPACE", "wa-rate"),
            tenant_concurrency: var_or("TENANT_CONCURRENCY", "5").parse().unwrap_or(5),
            global_concurrency: var_or("WORKER_POOL", "10").parse().unwrap_or(10),
            max_attempts: var_or("SEND_MAX_ATTEMPTS", "3").parse().unwrap_or(3),
            base_backoff: Duration::from_secs(var_or("SEND_BACKOFF_SECS", "5").parse().unwrap_or(5)),
        }
    }

    /// Tight timings for tests.
    pub fn for_tests() -> Self {
        Self {
            database_path: ":memory:".into(),
            nats_url: String::new(),
            provider_api_base: String::new(),
            rate_kv_namespace: "wa-rate".into(),
            tenant_concurrency: 5,
            global_concurrency: 10,
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
        }
    }
}
