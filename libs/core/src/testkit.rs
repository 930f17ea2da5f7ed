//! Builders for fixtures shared across crate tests.

use crate::phone::{normalize, PhoneNumber};
use crate::types::{TemplateDescriptor, Tenant, TenantLimits, TenantStatus};

pub fn phone(raw: &str) -> PhoneNumber {
    normalize(raw).expect("test phone number")
}

/// An active tenant with sane defaults; tweak fields as needed.
pub fn tenant(id: &str) -> Tenant {
    Tenant {
        id: id.to_string(),
        name: "مطعم الذواقة".into(),
        wa_number: phone("+966500000001"),
        account_sid: format!("AC{id}"),
        auth_token: "test-auth-token".into(),
        require_signature: false,
        is_active: true,
        status: TenantStatus::Active,
        limits: TenantLimits::default(),
        merchant_id: Some(format!("merchant-{id}")),
        currency: "SAR".into(),
        welcome_template: Some(TemplateDescriptor {
            sid: "HXwelcome".into(),
            friendly_name: "welcome_message".into(),
        }),
        order_template: Some(TemplateDescriptor {
            sid: "HXorder".into(),
            friendly_name: "order_update".into(),
        }),
    }
}
