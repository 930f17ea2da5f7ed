//! Shared handler state.

use std::sync::Arc;

use wg_core::bus::SharedBus;
use wg_flow::{FlowEngine, SharedEnqueuer};
use wg_idempotency::IdempotencyGuard;
use wg_ratelimit::RateLimiter;
use wg_store::{Store, TenantRegistry};

use crate::config::GatewayConfig;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub registry: TenantRegistry,
    pub bus: SharedBus,
    pub idem: IdempotencyGuard,
    pub limiter: RateLimiter,
    pub engine: Arc<FlowEngine>,
    pub enqueuer: SharedEnqueuer,
    pub config: Arc<GatewayConfig>,
}
