//! Shared value types for the gateway, workers, and store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::phone::PhoneNumber;

/// Fresh opaque identifier for rows and jobs.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current instant as an RFC3339 string, the wire format for all timestamps.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

/// Onboarding state of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Pending,
    Active,
    Rejected,
    Inactive,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Pending => "PENDING",
            TenantStatus::Active => "ACTIVE",
            TenantStatus::Rejected => "REJECTED",
            TenantStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TenantStatus::Pending),
            "ACTIVE" => Some(TenantStatus::Active),
            "REJECTED" => Some(TenantStatus::Rejected),
            "INACTIVE" => Some(TenantStatus::Inactive),
            _ => None,
        }
    }
}

/// Per-tenant pacing and quota limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantLimits {
    pub per_minute: u32,
    pub per_day: u32,
    pub monthly_conversations: u32,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_day: 1000,
            monthly_conversations: 1000,
        }
    }
}

/// Pre-approved template identity: the raw provider descriptor plus the
/// human-friendly name surfaced in events and API payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDescriptor {
    pub sid: String,
    pub friendly_name: String,
}

/// Which template a job should fall back to outside the messaging window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateIntent {
    Welcome,
    OrderUpdate,
}

/// A restaurant bound to one sender number and one set of provider
/// credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub wa_number: PhoneNumber,
    pub account_sid: String,
    pub auth_token: String,
    pub require_signature: bool,
    pub is_active: bool,
    pub status: TenantStatus,
    pub limits: TenantLimits,
    pub merchant_id: Option<String>,
    pub currency: String,
    pub welcome_template: Option<TemplateDescriptor>,
    pub order_template: Option<TemplateDescriptor>,
}

impl Tenant {
    /// A tenant takes traffic only when active in both senses.
    pub fn accepts_traffic(&self) -> bool {
        self.is_active && self.status == TenantStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

/// Outbound delivery channel chosen at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Freeform,
    Template,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Freeform => "freeform",
            Channel::Template => "template",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Interactive,
    Location,
    Template,
    Media,
    Button,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Interactive => "interactive",
            MessageKind::Location => "location",
            MessageKind::Template => "template",
            MessageKind::Media => "media",
            MessageKind::Button => "button",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "interactive" => Some(MessageKind::Interactive),
            "location" => Some(MessageKind::Location),
            "template" => Some(MessageKind::Template),
            "media" => Some(MessageKind::Media),
            "button" => Some(MessageKind::Button),
            _ => None,
        }
    }
}

/// Inbound message content, parsed once at the webhook boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InboundPayload {
    Text {
        body: String,
    },
    /// Quick-reply button click carrying a server-defined id.
    Button {
        payload: String,
        text: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        address: Option<String>,
    },
    Media {
        url: String,
        content_type: Option<String>,
        caption: Option<String>,
    },
    /// List/row selections from interactive messages; the body carries the
    /// selected token.
    Interactive {
        body: String,
    },
}

impl InboundPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundPayload::Text { .. } => MessageKind::Text,
            InboundPayload::Button { .. } => MessageKind::Button,
            InboundPayload::Location { .. } => MessageKind::Location,
            InboundPayload::Media { .. } => MessageKind::Media,
            InboundPayload::Interactive { .. } => MessageKind::Interactive,
        }
    }

    /// Text persisted as the message body.
    pub fn body_text(&self) -> String {
        match self {
            InboundPayload::Text { body } | InboundPayload::Interactive { body } => body.clone(),
            InboundPayload::Button { text, payload } => {
                if text.is_empty() {
                    payload.clone()
                } else {
                    text.clone()
                }
            }
            InboundPayload::Location {
                latitude,
                longitude,
                address,
            } => address
                .clone()
                .unwrap_or_else(|| format!("{latitude},{longitude}")),
            InboundPayload::Media { caption, url, .. } => {
                caption.clone().unwrap_or_else(|| url.clone())
            }
        }
    }

    pub fn media_url(&self) -> Option<&str> {
        match self {
            InboundPayload::Media { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// Normalized webhook request after boundary parsing, before tenant
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInbound {
    /// Destination (tenant sender) number.
    pub to: PhoneNumber,
    /// Source (customer) number.
    pub from: PhoneNumber,
    pub provider_sid: String,
    pub profile_name: Option<String>,
    pub payload: InboundPayload,
    pub received_at: String,
}

/// Kind of an outbound job body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    Text,
    Media,
}

/// A queued outbound send. The worker picks freeform vs template at dispatch
/// time; the job only carries the body and the fallback intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundJob {
    pub request_id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub customer_wa: PhoneNumber,
    pub from_wa: PhoneNumber,
    pub kind: OutboundKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub intent: TemplateIntent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_variables: Option<BTreeMap<String, String>>,
    /// Button-response sends bypass the window check entirely.
    #[serde(default)]
    pub force_freeform: bool,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: String,
}

impl OutboundJob {
    pub fn text(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        customer_wa: PhoneNumber,
        from_wa: PhoneNumber,
        body: impl Into<String>,
    ) -> Self {
        Self {
            request_id: new_id(),
            tenant_id: tenant_id.into(),
            conversation_id: conversation_id.into(),
            customer_wa,
            from_wa,
            kind: OutboundKind::Text,
            body: body.into(),
            media_url: None,
            intent: TemplateIntent::OrderUpdate,
            template_variables: None,
            force_freeform: false,
            attempt: 0,
            created_at: now_rfc3339(),
        }
    }
}

/// Prefetch job emitted after the first successful welcome send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapJob {
    pub tenant_id: String,
    pub conversation_id: String,
    pub customer_wa: PhoneNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    Confirmed,
    Preparing,
    OutForDelivery,
    Delivered,
    Rated,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Preparing => "PREPARING",
            OrderStatus::OutForDelivery => "OUT_FOR_DELIVERY",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Rated => "RATED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(OrderStatus::Draft),
            "CONFIRMED" => Some(OrderStatus::Confirmed),
            "PREPARING" => Some(OrderStatus::Preparing),
            "OUT_FOR_DELIVERY" => Some(OrderStatus::OutForDelivery),
            "DELIVERED" => Some(OrderStatus::Delivered),
            "RATED" => Some(OrderStatus::Rated),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Transitions move forward only; cancellation is allowed from any
    /// non-terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if next == OrderStatus::Cancelled {
            return !matches!(
                self,
                OrderStatus::Delivered | OrderStatus::Rated | OrderStatus::Cancelled
            );
        }
        if *self == OrderStatus::Cancelled {
            return false;
        }
        next > *self
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Delivery,
    Takeaway,
    DineIn,
    FromCar,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Delivery => "Delivery",
            OrderType::Takeaway => "Takeaway",
            OrderType::DineIn => "DineIn",
            OrderType::FromCar => "FromCar",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Delivery" => Some(OrderType::Delivery),
            "Takeaway" => Some(OrderType::Takeaway),
            "DineIn" => Some(OrderType::DineIn),
            "FromCar" => Some(OrderType::FromCar),
            _ => None,
        }
    }

    /// Delivery needs an address; everything else needs a branch.
    pub fn needs_address(&self) -> bool {
        matches!(self, OrderType::Delivery)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Online,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Online => "online",
            PaymentMethod::Cash => "cash",
        }
    }
}

/// One cart/order line. Prices are minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub item_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_minor: i64,
}

impl OrderItem {
    pub fn line_total_minor(&self) -> i64 {
        self.unit_price_minor * i64::from(self.quantity)
    }
}

/// Customer delivery destination captured from a location message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAddress {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

/// Selected pickup branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRef {
    pub id: String,
    pub name: String,
    pub address: String,
    pub phone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::normalize;

    #[test]
    fn order_status_is_monotonic_except_cancel() {
        assert!(OrderStatus::Draft.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Preparing));
        assert!(!OrderStatus::Preparing.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Preparing.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Confirmed));
    }

    #[test]
    fn payload_kind_and_body() {
        let p = InboundPayload::Button {
            payload: "view_order".into(),
            text: "عرض الطلب".into(),
        };
        assert_eq!(p.kind(), MessageKind::Button);
        assert_eq!(p.body_text(), "عرض الطلب");

        let loc = InboundPayload::Location {
            latitude: 24.7,
            longitude: 46.6,
            address: None,
        };
        assert_eq!(loc.body_text(), "24.7,46.6");
    }

    #[test]
    fn outbound_job_round_trips_json() {
        let job = OutboundJob::text(
            "t1",
            "c1",
            normalize("+201000000001").unwrap(),
            normalize("+966500000001").unwrap(),
            "مرحبا",
        );
        let raw = serde_json::to_string(&job).unwrap();
        let parsed: OutboundJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.body, "مرحبا");
        assert_eq!(parsed.kind, OutboundKind::Text);
        assert!(!parsed.force_freeform);
    }
}
