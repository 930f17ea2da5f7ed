//! Canonical `+E164` phone handling.
//!
//! Every address entering the system (webhook `From`/`To`, send API
//! `phoneNumber`, tenant sender numbers) is normalized here exactly once;
//! storage, caches, and subjects all key on the canonical form.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Channel prefix used by the provider on webhook addresses.
pub const WA_PREFIX: &str = "whatsapp:";

const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number contains invalid characters: {0:?}")]
    InvalidChars(String),
    #[error("phone number has {0} digits, expected {MIN_DIGITS}..={MAX_DIGITS}")]
    BadLength(usize),
}

/// A canonical `+E164` number. Construct via [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The provider-facing address form (`whatsapp:+E164`).
    pub fn wa_address(&self) -> String {
        format!("{WA_PREFIX}{}", self.0)
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes `raw` into canonical `+E164`.
///
/// Accepts the channel prefix (`whatsapp:+966...`), bare international
/// digits (`9665...`), `00`-prefixed dialing (`009665...`), and common
/// separators (spaces, dashes, dots, parentheses).
///
/// ```
/// use wg_core::phone::normalize;
///
/// assert_eq!(normalize("whatsapp:+966 50-000-0001").unwrap().as_str(), "+966500000001");
/// assert_eq!(normalize("00966500000001").unwrap().as_str(), "+966500000001");
/// ```
pub fn normalize(raw: &str) -> Result<PhoneNumber, PhoneError> {
    normalize_with_region(raw, None)
}

/// Like [`normalize`] but resolves local numbers (leading `0`) against a
/// default country code, e.g. `966`.
pub fn normalize_with_region(raw: &str, default_cc: Option<&str>) -> Result<PhoneNumber, PhoneError> {
    let mut s = raw.trim();
    if let Some(prefix) = s.get(..WA_PREFIX.len()) {
        if prefix.eq_ignore_ascii_case(WA_PREFIX) {
            s = &s[WA_PREFIX.len()..];
        }
    }
    if s.is_empty() {
        return Err(PhoneError::Empty);
    }

    let mut digits = String::with_capacity(s.len());
    let mut plus = false;
    for (i, ch) in s.chars().enumerate() {
        match ch {
            '+' if i == 0 => plus = true,
            '0'..='9' => digits.push(ch),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return Err(PhoneError::InvalidChars(raw.to_string())),
        }
    }
    if digits.is_empty() {
        return Err(PhoneError::Empty);
    }

    if !plus {
        if let Some(rest) = digits.strip_prefix("00") {
            digits = rest.to_string();
        } else if digits.starts_with('0') {
            if let Some(cc) = default_cc {
                digits = format!("{cc}{}", digits.trim_start_matches('0'));
            }
        }
    }
    // A leading zero never survives in E164.
    let digits = digits.trim_start_matches('0').to_string();

    if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
        return Err(PhoneError::BadLength(digits.len()));
    }
    Ok(PhoneNumber(format!("+{digits}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_channel_prefix_and_separators() {
        assert_eq!(
            normalize("whatsapp:+966 (50) 000-0001").unwrap().as_str(),
            "+966500000001"
        );
    }

    #[test]
    fn accepts_bare_and_double_zero_forms() {
        assert_eq!(normalize("966500000001").unwrap().as_str(), "+966500000001");
        assert_eq!(normalize("00966500000001").unwrap().as_str(), "+966500000001");
    }

    #[test]
    fn local_form_needs_region() {
        let n = normalize_with_region("0500000001", Some("966")).unwrap();
        assert_eq!(n.as_str(), "+966500000001");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize("not-a-number"), Err(PhoneError::InvalidChars("not-a-number".into())));
        assert_eq!(normalize("   "), Err(PhoneError::Empty));
        assert_eq!(normalize("+123"), Err(PhoneError::BadLength(3)));
    }

    #[test]
    fn wa_address_round_trip() {
        let n = normalize("+966500000001").unwrap();
        assert_eq!(n.wa_address(), "whatsapp:+966500000001");
        assert_eq!(normalize(&n.wa_address()).unwrap(), n);
    }
}
