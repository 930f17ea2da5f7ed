//! Messaging-provider HTTP client and webhook signature checks.
//!
//! The provider speaks form-encoded webhooks signed with HMAC-SHA1 over the
//! public URL plus the byte-sorted form parameters, and a REST send API
//! authenticated per tenant account.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::phone::PhoneNumber;
use crate::types::{Channel, TemplateDescriptor, Tenant};

type HmacSha1 = Hmac<Sha1>;

/// Hard deadline for provider calls.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("provider returned retryable status {status}: {detail}")]
    Retryable { status: u16, detail: String },
    #[error("provider rejected the message ({status}): {detail}")]
    Terminal { status: u16, detail: String },
    #[error("provider response missing message sid")]
    MalformedResponse,
}

impl ProviderError {
    /// Timeouts, transport failures, 408/429, and 5xx are worth retrying;
    /// every other 4xx is terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Terminal { .. })
    }

    fn from_status(status: u16, detail: String) -> Self {
        if status == 408 || status == 429 || status >= 500 {
            ProviderError::Retryable { status, detail }
        } else {
            ProviderError::Terminal { status, detail }
        }
    }
}

/// Result of an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub sid: String,
    pub channel: Channel,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send_freeform(
        &self,
        tenant: &Tenant,
        to: &PhoneNumber,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<SendOutcome, ProviderError>;

    async fn send_template(
        &self,
        tenant: &Tenant,
        to: &PhoneNumber,
        descriptor: &TemplateDescriptor,
        variables: &BTreeMap<String, String>,
    ) -> Result<SendOutcome, ProviderError>;
}

pub type SharedProvider = Arc<dyn ProviderClient>;

#[derive(Deserialize)]
struct MessageResponse {
    sid: Option<String>,
}

/// REST client for the real provider API.
pub struct HttpProviderClient {
    http: reqwest::Client,
    api_base: String,
}

impl HttpProviderClient {
    pub fn new(api_base: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.into(),
        })
    }

    fn messages_url(&self, account_sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            account_sid
        )
    }

    async fn post_form(
        &self,
        tenant: &Tenant,
        form: &[(&str, String)],
        channel: Channel,
    ) -> Result<SendOutcome, ProviderError> {
        let url = self.messages_url(&tenant.account_sid);
        let response = self
            .http
            .post(url)
            .basic_auth(&tenant.account_sid, Some(&tenant.auth_token))
            .form(form)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), detail));
        }

        let parsed: MessageResponse = response
            .json()
            .await
            .map_err(|_| ProviderError::MalformedResponse)?;
        let sid = parsed.sid.ok_or(ProviderError::MalformedResponse)?;
        Ok(SendOutcome { sid, channel })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn send_freeform(
        &self,
        tenant: &Tenant,
        to: &PhoneNumber,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<SendOutcome, ProviderError> {
        let mut form = vec![
            ("From", tenant.wa_number.wa_address()),
            ("To", to.wa_address()),
            ("Body", body.to_string()),
        ];
        if let Some(url) = media_url {
            form.push(("MediaUrl", url.to_string()));
        }
        self.post_form(tenant, &form, Channel::Freeform).await
    }

    async fn send_template(
        &self,
        tenant: &Tenant,
        to: &PhoneNumber,
        descriptor: &TemplateDescriptor,
        variables: &BTreeMap<String, String>,
    ) -> Result<SendOutcome, ProviderError> {
        let vars = serde_json::to_string(variables).unwrap_or_else(|_| "{}".into());
        let form = vec![
            ("From", tenant.wa_number.wa_address()),
            ("To", to.wa_address()),
            ("ContentSid", descriptor.sid.clone()),
            ("ContentVariables", vars),
        ];
        self.post_form(tenant, &form, Channel::Template).await
    }
}

/// What a recording provider saw; used by worker and pipeline tests.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub to: PhoneNumber,
    pub body: String,
    pub channel: Channel,
    pub template_sid: Option<String>,
}

/// Test double that hands out sequential sids and records every send.
#[derive(Default)]
pub struct RecordingProvider {
    sends: Mutex<Vec<RecordedSend>>,
    /// Errors popped front-first before any successful send.
    failures: Mutex<Vec<ProviderError>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_failure(&self, err: ProviderError) {
        self.failures.lock().await.push(err);
    }

    pub async fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().await.clone()
    }

    async fn record(&self, send: RecordedSend) -> Result<SendOutcome, ProviderError> {
        {
            let mut failures = self.failures.lock().await;
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        let channel = send.channel;
        let mut sends = self.sends.lock().await;
        sends.push(send);
        Ok(SendOutcome {
            sid: format!("SM{:08}", sends.len()),
            channel,
        })
    }
}

#[async_trait]
impl ProviderClient for RecordingProvider {
    async fn send_freeform(
        &self,
        _tenant: &Tenant,
        to: &PhoneNumber,
        body: &str,
        _media_url: Option<&str>,
    ) -> Result<SendOutcome, ProviderError> {
        self.record(RecordedSend {
            to: to.clone(),
            body: body.to_string(),
            channel: Channel::Freeform,
            template_sid: None,
        })
        .await
    }

    async fn send_template(
        &self,
        _tenant: &Tenant,
        to: &PhoneNumber,
        descriptor: &TemplateDescriptor,
        variables: &BTreeMap<String, String>,
    ) -> Result<SendOutcome, ProviderError> {
        let body = variables.get("1").cloned().unwrap_or_default();
        self.record(RecordedSend {
            to: to.clone(),
            body,
            channel: Channel::Template,
            template_sid: Some(descriptor.sid.clone()),
        })
        .await
    }
}

/// Computes the webhook signature: HMAC-SHA1 over the public URL followed by
/// every form parameter in byte-sorted key order (`key` then `value`),
/// base64-encoded.
pub fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(payload.as_bytes());
    B64.encode(mac.finalize().into_bytes())
}

/// Constant-time verification of the webhook signature header.
pub fn verify_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    provided: &str,
) -> bool {
    let expected = compute_signature(auth_token, url, params);
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
