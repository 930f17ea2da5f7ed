//! NATS subject helpers (multi-tenant/topic-safe).

use std::borrow::Cow;

/// JetStream stream holding queued outbound jobs.
pub const OUT_STREAM: &str = "wa-out";
/// Wildcard covering every outbound subject.
pub const OUT_SUBJECTS: &str = "wa.out.>";
/// JetStream stream holding bootstrap prefetch jobs.
pub const BOOTSTRAP_STREAM: &str = "wa-bootstrap";
pub const BOOTSTRAP_SUBJECTS: &str = "wa.bootstrap.*";

/// Normalizes identifiers to be subject-safe (replace separators, trim).
fn norm<S: AsRef<str>>(s: S) -> Cow<'static, str> {
    let mut t = s
        .as_ref()
        .trim()
        .replace([' ', '\t', '\n', '\r', '*', '>', '/', '.'], "-");
    if t.is_empty() {
        t = "unknown".into();
    }
    Cow::Owned(t)
}

/// Outbound job subject; the `{tenant}.{conversation}` tail is the FIFO
/// sub-key.
///
/// ```
/// use wg_core::subjects::out_subject;
///
/// assert_eq!(out_subject("t1", "conv 9"), "wa.out.t1.conv-9");
/// ```
pub fn out_subject(tenant: &str, conversation: &str) -> String {
    format!("wa.out.{}.{}", norm(tenant), norm(conversation))
}

pub fn bootstrap_subject(tenant: &str) -> String {
    format!("wa.bootstrap.{}", norm(tenant))
}

/// Per-tenant event channels consumed by dashboard fan-out.
pub fn evt_msg(tenant: &str) -> String {
    format!("wa.evt.msg.{}", norm(tenant))
}

pub fn evt_conv(tenant: &str) -> String {
    format!("wa.evt.conv.{}", norm(tenant))
}

pub fn evt_order(tenant: &str) -> String {
    format!("wa.evt.order.{}", norm(tenant))
}

pub fn evt_quota(tenant: &str) -> String {
    format!("wa.evt.quota.{}", norm(tenant))
}

/// System-wide automation flag changes.
pub fn evt_bot_status() -> String {
    "wa.evt.bot.status".to_string()
}

/// Cache-invalidation fan-out after admin writes.
pub fn admin_invalidate() -> String {
    "wa.admin.invalidate".to_string()
}
