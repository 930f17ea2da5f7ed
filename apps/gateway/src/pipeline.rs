//! The inbound webhook pipeline.
//!
//! Ordered steps; each failure aborts with a defined status. Once the
//! idempotency lock is taken, persistence failures are acknowledged with
//! 200 so the provider does not retry into a duplicate.

use axum::http::{HeaderMap, StatusCode};
use serde_json::json;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use wg_core::bus::{emit, Event, EventKind};
use wg_core::phone;
use wg_core::provider::verify_signature;
use wg_core::types::{InboundPayload, WebhookInbound};
use wg_flow::{handle_button_click, InboundContext};
use wg_idempotency::IdemKey;
use wg_ratelimit::Bucket;
use wg_store::{LogSeverity, MessageRow, NewInbound, RegistryError, WebhookLogEntry};

use crate::state::AppState;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Terminal pipeline outcome, rendered by the HTTP layer.
pub struct PipelineOutcome {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl PipelineOutcome {
    fn new(status: StatusCode, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    fn ok(detail: &str) -> Self {
        Self::new(StatusCode::OK, json!({ "status": detail }))
    }
}

pub async fn process(
    state: &AppState,
    headers: &HeaderMap,
    content_type: Option<&str>,
    body: &[u8],
) -> PipelineOutcome {
    let now = OffsetDateTime::now_utc();
    let digest = body_digest(body);

    if !content_type
        .map(|c| c.starts_with(FORM_CONTENT_TYPE))
        .unwrap_or(false)
    {
        log_exit(state, None, &digest, 415, LogSeverity::Warn, now).await;
        return PipelineOutcome::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            json!({ "error": "expected form-encoded body" }),
        );
    }

    let params: Vec<(String, String)> = url::form_urlencoded::parse(body)
        .into_owned()
        .collect();
    let inbound = match parse_webhook(&params, state.config.default_country_code.as_deref(), now) {
        Ok(inbound) => inbound,
        Err(reason) => {
            log_exit(state, None, &digest, 400, LogSeverity::Warn, now).await;
            return PipelineOutcome::new(StatusCode::BAD_REQUEST, json!({ "error": reason }));
        }
    };

    // Tenant resolution; the signature secret is per tenant, so this comes
    // before the signature check.
    let tenant = match state.registry.resolve_by_destination(&inbound.to).await {
        Ok(tenant) => tenant,
        Err(RegistryError::NotFound(dest)) => {
            warn!(destination = %dest, "webhook for unknown tenant");
            log_exit(state, None, &digest, 404, LogSeverity::Error, now).await;
            return PipelineOutcome::new(
                StatusCode::NOT_FOUND,
                json!({ "error": "unknown destination" }),
            );
        }
        Err(RegistryError::Inactive(dest)) => {
            // Dropped silently: the provider must not retry these.
            info!(destination = %dest, "webhook for inactive tenant dropped");
            log_exit(state, None, &digest, 200, LogSeverity::Warn, now).await;
            return PipelineOutcome::ok("dropped");
        }
        Err(RegistryError::Store(err)) => {
            error!(error = %err, "tenant resolution failed");
            log_exit(state, None, &digest, 500, LogSeverity::Error, now).await;
            return PipelineOutcome::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "resolution failed" }),
            );
        }
    };

    if tenant.require_signature {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let valid = verify_signature(
            &tenant.auth_token,
            &state.config.webhook_public_url,
            &params,
            provided,
        );
        if !valid {
            warn!(tenant = %tenant.id, "webhook signature mismatch");
            log_exit(state, Some(&tenant.id), &digest, 403, LogSeverity::Security, now).await;
            return PipelineOutcome::new(
                StatusCode::FORBIDDEN,
                json!({ "error": "signature mismatch" }),
            );
        }
    }

    // Global, then (after dedupe) tenant + customer buckets.
    match state
        .limiter
        .check(
            &Bucket::global_webhook(),
            state.config.global_webhook_per_minute,
        )
        .await
    {
        Ok(decision) if decision.is_allowed() => {}
        Ok(decision) => {
            log_exit(state, Some(&tenant.id), &digest, 429, LogSeverity::Warn, now).await;
            return rate_limited(decision.retry_after().as_secs());
        }
        Err(err) => error!(error = %err, "global rate check failed; allowing"),
    }

    let idem_key = IdemKey::Msg(inbound.provider_sid.clone());
    match state.idem.try_acquire(&idem_key).await {
        Ok(true) => {}
        Ok(false) => {
            log_exit(state, Some(&tenant.id), &digest, 200, LogSeverity::Info, now).await;
            return PipelineOutcome::ok("duplicate");
        }
        Err(err) => {
            // Degraded dedupe: the unique constraint on provider_sid still
            // holds the line.
            warn!(error = %err, "idempotency store unavailable; relying on constraint");
        }
    }

    for (bucket, limit) in [
        (
            Bucket::tenant_inbound(&tenant.id),
            tenant.limits.per_minute,
        ),
        (
            Bucket::customer(&tenant.id, inbound.from.as_str()),
            state.config.customer_per_minute,
        ),
    ] {
        match state.limiter.check(&bucket, limit).await {
            Ok(decision) if decision.is_allowed() => {}
            Ok(decision) => {
                log_exit(state, Some(&tenant.id), &digest, 429, LogSeverity::Warn, now).await;
                return rate_limited(decision.retry_after().as_secs());
            }
            Err(err) => error!(error = %err, "rate check failed; allowing"),
        }
    }

    // Session + quota accounting. Quota overruns never drop the inbound.
    let mut quota_suppressed = false;
    match state
        .store
        .detect_session(&tenant.id, &inbound.from, now)
        .await
    {
        Ok(touch) => {
            if touch.is_new {
                match state
                    .store
                    .record_new_session(&tenant.id, tenant.limits.monthly_conversations, now)
                    .await
                {
                    Ok(quota) if quota.exceeded() => {
                        quota_suppressed = true;
                        emit(
                            state.bus.as_ref(),
                            Event::new(
                                EventKind::QuotaExceeded,
                                &tenant.id,
                                json!({
                                    "conversationCount": quota.conversation_count,
                                    "limit": quota.limit,
                                }),
                            ),
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "monthly usage update failed"),
                }
            } else {
                match state
                    .store
                    .monthly_usage(&tenant.id, tenant.limits.monthly_conversations, now)
                    .await
                {
                    Ok(quota) => quota_suppressed = quota.exceeded(),
                    Err(err) => error!(error = %err, "monthly usage read failed"),
                }
            }
        }
        Err(err) => error!(error = %err, "session detection failed"),
    }

    // Persist. From here on the provider gets 200 regardless: the lock is
    // taken, a retry would only duplicate.
    let (conversation, message) = match persist(state, &tenant.id, &inbound, now).await {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, sid = %inbound.provider_sid, "inbound persistence failed after idempotency commit");
            log_exit(state, Some(&tenant.id), &digest, 200, LogSeverity::Error, now).await;
            return PipelineOutcome::ok("accepted");
        }
    };

    wg_core::telemetry::count_tenant("messages_ingressed", &tenant.id);
    emit(
        state.bus.as_ref(),
        Event::new(
            EventKind::MessageReceived,
            &tenant.id,
            json!({
                "messageId": message.id,
                "conversationId": conversation.id,
                "from": inbound.from.as_str(),
                "kind": message.kind.as_str(),
                "body": message.body,
            }),
        ),
    )
    .await;
    emit(
        state.bus.as_ref(),
        Event::new(
            EventKind::ConversationUpdated,
            &tenant.id,
            json!({
                "conversationId": conversation.id,
                "unreadCount": conversation.unread_count,
                "customer": conversation.customer_wa.as_str(),
            }),
        ),
    )
    .await;

    dispatch(state, &tenant, &conversation.id, &inbound, quota_suppressed, now).await;

    log_exit(state, Some(&tenant.id), &digest, 200, LogSeverity::Info, now).await;
    PipelineOutcome::ok("accepted")
}

async fn persist(
    state: &AppState,
    tenant_id: &str,
    inbound: &WebhookInbound,
    now: OffsetDateTime,
) -> Result<(wg_store::ConversationRow, MessageRow), wg_store::StoreError> {
    let conversation = state
        .store
        .upsert_conversation(tenant_id, &inbound.from, now)
        .await?;
    let metadata = json!({
        "profileName": inbound.profile_name,
        "payload": inbound.payload,
    });
    let (message, _created) = state
        .store
        .create_inbound(NewInbound {
            conversation_id: conversation.id.clone(),
            tenant_id: tenant_id.to_string(),
            provider_sid: inbound.provider_sid.clone(),
            kind: inbound.payload.kind(),
            body: inbound.payload.body_text(),
            media_url: inbound.payload.media_url().map(str::to_string),
            metadata,
            at: now,
        })
        .await?;
    let conversation = state
        .store
        .conversation_by_id(&conversation.id)
        .await?
        .unwrap_or(conversation);
    Ok((conversation, message))
}

/// Step 9: button path first, then the state machine; quota suppression and
/// the global/bot flags gate both.
async fn dispatch(
    state: &AppState,
    tenant: &wg_core::types::Tenant,
    conversation_id: &str,
    inbound: &WebhookInbound,
    quota_suppressed: bool,
    now: OffsetDateTime,
) {
    if quota_suppressed {
        info!(tenant = %tenant.id, "automation suppressed by monthly quota");
        return;
    }
    match state.store.bot_enabled().await {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            error!(error = %err, "bot flag read failed; skipping dispatch");
            return;
        }
    }
    let conversation = match state.store.conversation_by_id(conversation_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return,
        Err(err) => {
            error!(error = %err, "conversation reload failed");
            return;
        }
    };
    if !conversation.is_bot_active {
        return;
    }

    if let InboundPayload::Button { payload, .. } = &inbound.payload {
        match handle_button_click(
            &state.store,
            &state.enqueuer,
            tenant,
            &conversation,
            payload,
            now,
        )
        .await
        {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                error!(error = %err, "button path failed");
                return;
            }
        }
    }

    let ctx = InboundContext {
        tenant,
        conversation: &conversation,
        payload: &inbound.payload,
        profile_name: inbound.profile_name.as_deref(),
        now,
    };
    if let Err(err) = state.engine.handle_inbound(ctx).await {
        error!(error = %err, conversation = %conversation.id, "state machine dispatch failed");
    }
}

fn rate_limited(retry_after_secs: u64) -> PipelineOutcome {
    PipelineOutcome::new(
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "error": "rate_limited", "retryAfter": retry_after_secs }),
    )
}

/// Parses the provider's form fields into the tagged inbound payload.
pub fn parse_webhook(
    params: &[(String, String)],
    default_cc: Option<&str>,
    now: OffsetDateTime,
) -> Result<WebhookInbound, &'static str> {
    let get = |key: &str| -> Option<&str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    };

    let from_raw = get("From").ok_or("missing From")?;
    let to_raw = get("To").ok_or("missing To")?;
    let provider_sid = get("MessageSid").ok_or("missing MessageSid")?.to_string();
    let from = phone::normalize_with_region(from_raw, default_cc).map_err(|_| "invalid From")?;
    let to = phone::normalize_with_region(to_raw, default_cc).map_err(|_| "invalid To")?;

    let body = get("Body").unwrap_or_default().to_string();
    let payload = if let Some(button) = get("ButtonPayload") {
        InboundPayload::Button {
            payload: button.to_string(),
            text: get("ButtonText").unwrap_or_default().to_string(),
        }
    } else if let (Some(lat), Some(lng)) = (get("Latitude"), get("Longitude")) {
        InboundPayload::Location {
            latitude: lat.parse().map_err(|_| "invalid Latitude")?,
            longitude: lng.parse().map_err(|_| "invalid Longitude")?,
            address: get("Address").map(str::to_string),
        }
    } else if let Some(url) = get("MediaUrl0") {
        InboundPayload::Media {
            url: url.to_string(),
            content_type: get("MediaContentType0").map(str::to_string),
            caption: if body.is_empty() { None } else { Some(body) },
        }
    } else if let Some(list_id) = get("ListId") {
        InboundPayload::Interactive {
            body: list_id.to_string(),
        }
    } else {
        InboundPayload::Text { body }
    };

    Ok(WebhookInbound {
        to,
        from,
        provider_sid,
        profile_name: get("ProfileName").map(str::to_string),
        payload,
        received_at: fmt_now(now),
    })
}

fn fmt_now(now: OffsetDateTime) -> String {
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

async fn log_exit(
    state: &AppState,
    tenant_id: Option<&str>,
    digest: &str,
    status_code: u16,
    severity: LogSeverity,
    now: OffsetDateTime,
) {
    let entry = WebhookLogEntry {
        tenant_id: tenant_id.map(str::to_string),
        digest: digest.to_string(),
        status_code,
        severity,
    };
    if let Err(err) = state.store.log_webhook(entry, now).await {
        error!(error = %err, "webhook audit write failed");
    }
}

fn body_digest(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use wg_core::types::MessageKind;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_text_message() {
        let p = params(&[
            ("From", "whatsapp:+201000000001"),
            ("To", "whatsapp:+966500000001"),
            ("MessageSid", "M1"),
            ("Body", "hi"),
            ("ProfileName", "Ahmed"),
        ]);
        let inbound = parse_webhook(&p, None, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(inbound.from.as_str(), "+201000000001");
        assert_eq!(inbound.to.as_str(), "+966500000001");
        assert_eq!(inbound.provider_sid, "M1");
        assert_eq!(inbound.payload, InboundPayload::Text { body: "hi".into() });
        assert_eq!(inbound.profile_name.as_deref(), Some("Ahmed"));
    }

    #[test]
    fn button_payload_beats_body() {
        let p = params(&[
            ("From", "whatsapp:+201000000001"),
            ("To", "whatsapp:+966500000001"),
            ("MessageSid", "M2"),
            ("Body", "عرض الطلب"),
            ("ButtonPayload", "view_order"),
            ("ButtonText", "عرض الطلب"),
        ]);
        let inbound = parse_webhook(&p, None, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(inbound.payload.kind(), MessageKind::Button);
    }

    #[test]
    fn location_fields_parse() {
        let p = params(&[
            ("From", "whatsapp:+201000000001"),
            ("To", "whatsapp:+966500000001"),
            ("MessageSid", "M3"),
            ("Latitude", "24.7136"),
            ("Longitude", "46.6753"),
        ]);
        let inbound = parse_webhook(&p, None, OffsetDateTime::now_utc()).unwrap();
        match inbound.payload {
            InboundPayload::Location { latitude, .. } => assert!((latitude - 24.7136).abs() < 1e-9),
            other => panic!("expected location, got {other:?}"),
        }
    }

    #[test]
    fn media_and_missing_fields() {
        let p = params(&[
            ("From", "whatsapp:+201000000001"),
            ("To", "whatsapp:+966500000001"),
            ("MessageSid", "M4"),
            ("NumMedia", "1"),
            ("MediaUrl0", "https://media.example/abc"),
            ("MediaContentType0", "image/jpeg"),
        ]);
        let inbound = parse_webhook(&p, None, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(inbound.payload.kind(), MessageKind::Media);

        let missing = params(&[("From", "whatsapp:+201000000001")]);
        assert!(parse_webhook(&missing, None, OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = body_digest(b"Body=hi");
        let b = body_digest(b"Body=hi");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
