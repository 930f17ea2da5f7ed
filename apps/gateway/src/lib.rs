//! Webhook gateway: verifies, dedupes, rate-limits, persists, publishes,
//! and dispatches inbound WhatsApp traffic; exposes the internal send API
//! and the bot toggle.

pub mod config;
pub mod http;
pub mod outbound;
pub mod pipeline;
pub mod state;

pub use config::GatewayConfig;
pub use state::AppState;
