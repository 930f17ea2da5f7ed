//! Environment configuration for the bootstrap worker.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub database_path: String,
    pub nats_url: String,
    pub catalog_api_base: String,
    pub catalog_api_key: String,
    pub rate_kv_namespace: String,
    /// Concurrent prefetch jobs.
    pub parallelism: usize,
    /// Per-tenant jobs per minute.
    pub jobs_per_minute: u32,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl BootstrapConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: var_or("DATABASE_PATH", "wagate.db"),
            nats_url: var_or("NATS_URL", "nats://127.0.0.1:4222"),
            catalog_api_base: var_or("CATALOG_API_BASE", ""),
            catalog_api_key: var_or("CATALOG_API_KEY", ""),
            rate_kv_namespace: var_or("RATE_KV_NAMESPACE", "wa-rate"),
            parallelism: var_or("BOOTSTRAP_PARALLELISM", "5").parse().unwrap_or(5),
            jobs_per_minute: var_or("BOOTSTRAP_JOBS_PER_MINUTE", "20").parse().unwrap_or(20),
            max_attempts: var_or("BOOTSTRAP_MAX_ATTEMPTS", "3").parse().unwrap_or(3),
            base_backoff: Duration::from_secs(
                var_or("BOOTSTRAP_BACKOFF_SECS", "5").parse().unwrap_or(5),
            ),
        }
    }

    pub fn for_tests() -> Self {
        Self {
            database_path: ":memory:".into(),
            nats_url: String::new(),
            catalog_api_base: String::new(),
            catalog_api_key: String::new(),
            rate_kv_namespace: "wa-rate".into(),
            parallelism: 5,
            jobs_per_minute: 20,
            max_attempts: 3,
            base_backoff: Duration::from_millis(20),
        }
    }
}
