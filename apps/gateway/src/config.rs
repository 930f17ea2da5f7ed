//! Environment configuration for the gateway binary.

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind: String,
    pub database_path: String,
    pub nats_url: String,
    /// Public URL of the webhook endpoint, the base of signature payloads.
    pub webhook_public_url: String,
    /// Handshake token for the provider's GET verification.
    pub verify_token: String,
    /// Bearer token protecting the internal send API.
    pub send_api_token: String,
    pub provider_api_base: String,
    pub catalog_api_base: String,
    pub catalog_api_key: String,
    pub order_api_base: String,
    pub order_api_key: String,
    /// Tenant used by the send API when `fromNumber` is omitted.
    pub default_tenant_id: Option<String>,
    /// Country code applied to local-form numbers, e.g. `966`.
    pub default_country_code: Option<String>,
    pub global_webhook_per_minute: u32,
    pub customer_per_minute: u32,
    pub rate_kv_namespace: String,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            bind: var_or("BIND", "0.0.0.0:8080"),
            database_path: var_or("DATABASE_PATH", "wagate.db"),
            nats_url: var_or("NATS_URL", "nats://127.0.0.1:4222"),
            webhook_public_url: var_or(
                "WEBHOOK_PUBLIC_URL",
                "http://localhost:8080/whatsapp/webhook",
            ),
            verify_token: var_or("VERIFY_TOKEN", "change-me"),
            send_api_token: var_or("SEND_API_TOKEN", ""),
            provider_api_base: var_or("PROVIDER_API_BASE", "https://api.twilio.com"),
            catalog_api_base: var_or("CATALOG_API_BASE", ""),
            catalog_api_key: var_or("CATALOG_API_KEY", ""),
            order_api_base: var_or("ORDER_API_BASE", ""),
            order_api_key: var_or("ORDER_API_KEY", ""),
            default_tenant_id: std::env::var("DEFAULT_TENANT_ID").ok().filter(|v| !v.is_empty()),
            default_country_code: std::env::var("DEFAULT_COUNTRY_CODE")
                .ok()
                .filter(|v| !v.is_empty()),
            global_webhook_per_minute: var_or("GLOBAL_WEBHOOK_PER_MINUTE", "200")
                .parse()
                .unwrap_or(200),
            customer_per_minute: var_or("CUSTOMER_PER_MINUTE", "20").parse().unwrap_or(20),
            rate_kv_namespace: var_or("RATE_KV_NAMESPACE", "wa-rate"),
        }
    }

    /// Defaults suitable for in-process tests: no external URLs, permissive
    /// global limits, signature base matching the test router.
    pub fn for_tests() -> Self {
        Self {
            bind: "127.0.0.1:0".into(),
            database_path: ":memory:".into(),
            nats_url: String::new(),
            webhook_public_url: "http://localhost:8080/whatsapp/webhook".into(),
            verify_token: "test-verify".into(),
            send_api_token: "test-token".into(),
            provider_api_base: String::new(),
            catalog_api_base: String::new(),
            catalog_api_key: String::new(),
            order_api_base: String::new(),
            order_api_key: String::new(),
            default_tenant_id: None,
            default_country_code: Some("966".into()),
            global_webhook_per_minute: 200,
            customer_per_minute: 20,
            rate_kv_namespace: "wa-rate".into(),
        }
    }
}
