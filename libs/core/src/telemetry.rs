//! Tracing/metrics installation shared by the binaries.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INSTALL: Once = Once::new();

/// Installs the global tracing subscriber once per process. Subsequent calls
/// are no-ops so tests can call it freely.
pub fn install(service: &str) {
    INSTALL.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
        tracing::info!(service, "telemetry installed");
    });
}

/// Counter with a tenant label; the label set is kept deliberately small.
pub fn count_tenant(name: &'static str, tenant: &str) {
    metrics::counter!(name, "tenant" => tenant.to_string()).increment(1);
}

pub fn count(name: &'static str) {
    metrics::counter!(name).increment(1);
}

pub fn gauge_tenant(name: &'static str, tenant: &str, value: f64) {
    metrics::gauge!(name, "tenant" => tenant.to_string()).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install("test-a");
        install("test-b");
        count("telemetry_test_counter");
        count_tenant("telemetry_test_counter_tenant", "t1");
        gauge_tenant("telemetry_test_gauge", "t1", 1.0);
    }
}
