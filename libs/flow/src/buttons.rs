//! Button-response path.
//!
//! A click on a template's quick-reply button arrives as an inbound
//! `button` payload. The click itself re-opened the messaging window, so
//! the response is always forced freeform, and the state machine is never
//! involved.

use time::OffsetDateTime;
use tracing::info;
use wg_core::texts;
use wg_core::types::{OutboundJob, Tenant};
use wg_store::{ConversationRow, Store, StoreError};

use crate::enqueue::SharedEnqueuer;

/// Well-known button id carried by the order-update template.
pub const VIEW_ORDER: &str = "view_order";

/// Responds to a recognized button click with the cached payload (or an
/// apology when it expired). Returns `true` when `payload` was a known
/// button id.
pub async fn handle_button_click(
    store: &Store,
    enqueuer: &SharedEnqueuer,
    tenant: &Tenant,
    conversation: &ConversationRow,
    payload: &str,
    now: OffsetDateTime,
) -> Result<bool, StoreError> {
    if payload != VIEW_ORDER {
        return Ok(false);
    }

    let cached = store
        .consume_cached_payload(&tenant.id, &conversation.customer_wa, now)
        .await?;
    let body = match cached {
        Some(entry) => {
            info!(tenant = %tenant.id, template = %entry.template_sid, "cached payload delivered");
            entry.payload
        }
        None => texts::cached_order_unavailable(),
    };

    let mut job = OutboundJob::text(
        tenant.id.clone(),
        conversation.id.clone(),
        conversation.customer_wa.clone(),
        tenant.wa_number.clone(),
        body,
    );
    job.force_freeform = true;
    if let Err(err) = enqueuer.enqueue(job).await {
        return Err(StoreError::Internal(err));
    }
    Ok(true)
}
