//! HTTP surface: webhook verification + ingestion, the internal send API,
//! and the admin bot toggle.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::warn;
use wg_core::bus::{emit, Event, EventKind};
use wg_core::phone;
use wg_core::types::{new_id, OutboundJob, OutboundKind, TemplateIntent};
use wg_store::RegistryError;

use crate::pipeline;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/whatsapp/webhook", get(verify).post(receive))
        .route("/messages", post(send_message))
        .route("/bot/toggle", post(toggle_bot))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct VerifyQs {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
}

async fn verify(State(state): State<AppState>, Query(q): Query<VerifyQs>) -> impl IntoResponse {
    if q.mode.as_deref() == Some("subscribe")
        && q.token.as_deref() == Some(state.config.verify_token.as_str())
    {
        (StatusCode::OK, q.challenge.unwrap_or_default())
    } else {
        (StatusCode::FORBIDDEN, "forbidden".to_string())
    }
}

async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let outcome = pipeline::process(&state, &headers, content_type.as_deref(), &body).await;
    (outcome.status, Json(outcome.body))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    phone_number: String,
    text: String,
    #[serde(default)]
    from_number: Option<String>,
    #[serde(default)]
    template_variables: Option<BTreeMap<String, String>>,
    #[serde(default)]
    request_id: Option<String>,
}

fn bearer_ok(headers: &HeaderMap, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|s| s == format!("Bearer {token}"))
        .unwrap_or(false)
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> impl IntoResponse {
    if !bearer_ok(&headers, &state.config.send_api_token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid bearer token" })),
        );
    }

    let customer = match phone::normalize_with_region(
        &request.phone_number,
        state.config.default_country_code.as_deref(),
    ) {
        Ok(n) => n,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid phoneNumber: {err}") })),
            );
        }
    };

    // Tenant by explicit sender number, else the configured default.
    let tenant = if let Some(from) = request.from_number.as_deref() {
        let from = match phone::normalize_with_region(from, state.config.default_country_code.as_deref())
        {
            Ok(n) => n,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid fromNumber: {err}") })),
                );
            }
        };
        match state.registry.resolve_by_destination(&from).await {
            Ok(t) => t,
            Err(RegistryError::NotFound(dest)) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("no tenant is bound to {dest}") })),
                );
            }
            Err(RegistryError::Inactive(_)) => {
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "tenant is inactive" })),
                );
            }
            Err(RegistryError::Store(err)) => {
                warn!(error = %err, "send api tenant resolution failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "resolution failed" })),
                );
            }
        }
    } else {
        let Some(default_id) = state.config.default_tenant_id.clone() else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "fromNumber required (no default tenant configured)" })),
            );
        };
        match state.registry.load(&default_id).await {
            Ok(t) if t.accepts_traffic() => t,
            Ok(_) => {
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "tenant is inactive" })),
                );
            }
            Err(err) => {
                warn!(error = %err, "default tenant load failed");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "default tenant missing" })),
                );
            }
        }
    };

    let now = OffsetDateTime::now_utc();
    match state
        .store
        .monthly_usage(&tenant.id, tenant.limits.monthly_conversations, now)
        .await
    {
        Ok(quota) if quota.exceeded() => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "quota_exceeded",
                    "conversationCount": quota.conversation_count,
                    "limit": quota.limit,
                })),
            );
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "quota read failed; allowing send"),
    }

    let conversation = match state.store.upsert_conversation(&tenant.id, &customer, now).await {
        Ok(c) => c,
        Err(err) => {
            warn!(error = %err, "conversation upsert failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "persistence failed" })),
            );
        }
    };

    let request_id = request.request_id.unwrap_or_else(new_id);
    let job = OutboundJob {
        request_id: request_id.clone(),
        tenant_id: tenant.id.clone(),
        conversation_id: conversation.id,
        customer_wa: customer,
        from_wa: tenant.wa_number.clone(),
        kind: OutboundKind::Text,
        body: request.text,
        media_url: None,
        intent: TemplateIntent::OrderUpdate,
        template_variables: request.template_variables,
        force_freeform: false,
        attempt: 0,
        created_at: wg_core::types::now_rfc3339(),
    };
    if let Err(err) = state.enqueuer.enqueue(job).await {
        warn!(error = %err, "outbound enqueue failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "enqueue failed" })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "queued", "jobId": request_id })),
    )
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ToggleRequest>,
) -> impl IntoResponse {
    if !bearer_ok(&headers, &state.config.send_api_token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid bearer token" })),
        );
    }
    if let Err(err) = state.store.set_bot_enabled(request.enabled).await {
        warn!(error = %err, "bot toggle persist failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "persistence failed" })),
        );
    }
    emit(
        state.bus.as_ref(),
        Event::new(
            EventKind::BotStatus,
            "system",
            json!({ "enabled": request.enabled }),
        ),
    )
    .await;
    (StatusCode::OK, Json(json!({ "enabled": request.enabled })))
}
