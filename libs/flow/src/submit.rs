//! External order submission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use wg_core::phone::PhoneNumber;
use wg_core::types::{BranchRef, DeliveryAddress, OrderItem, OrderType, PaymentMethod};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Structured submission failures; each carries a stable wire code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrderSubmitError {
    #[error("no branch selected for a pickup order")]
    NoBranchSelected,
    #[error("payment method missing")]
    MissingPaymentMethod,
    #[error("order items are empty or malformed")]
    InvalidItems,
    #[error("merchant API error: {0}")]
    ApiError(String),
    #[error("order API configuration missing")]
    ConfigMissing,
    #[error("tenant has no merchant binding")]
    MerchantNotConfigured,
    #[error("customer address or contact missing")]
    CustomerInfoMissing,
}

impl OrderSubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            OrderSubmitError::NoBranchSelected => "NO_BRANCH_SELECTED",
            OrderSubmitError::MissingPaymentMethod => "MISSING_PAYMENT_METHOD",
            OrderSubmitError::InvalidItems => "INVALID_ITEMS",
            OrderSubmitError::ApiError(_) => "API_ERROR",
            OrderSubmitError::ConfigMissing => "CONFIG_MISSING",
            OrderSubmitError::MerchantNotConfigured => "MERCHANT_NOT_CONFIGURED",
            OrderSubmitError::CustomerInfoMissing => "CUSTOMER_INFO_MISSING",
        }
    }
}

/// Fully assembled order handed to the merchant platform.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSubmission {
    pub merchant_id: String,
    pub order_type: OrderType,
    pub items: Vec<OrderItem>,
    pub total_minor: i64,
    pub currency: String,
    pub customer_wa: PhoneNumber,
    pub customer_name: Option<String>,
    pub address: Option<DeliveryAddress>,
    pub branch: Option<BranchRef>,
    pub payment_method: PaymentMethod,
}

impl OrderSubmission {
    /// Local validation mirroring what the merchant API would reject; runs
    /// before any network call.
    pub fn validate(&self) -> Result<(), OrderSubmitError> {
        if self.items.is_empty() || self.items.iter().any(|i| i.quantity == 0) {
            return Err(OrderSubmitError::InvalidItems);
        }
        match self.order_type {
            OrderType::Delivery if self.address.is_none() => {
                Err(OrderSubmitError::CustomerInfoMissing)
            }
            OrderType::Delivery => Ok(()),
            _ if self.branch.is_none() => Err(OrderSubmitError::NoBranchSelected),
            _ => Ok(()),
        }
    }
}

#[async_trait]
pub trait OrderApi: Send + Sync {
    /// Submits the order and returns the merchant's order number.
    async fn submit(&self, submission: &OrderSubmission) -> Result<String, OrderSubmitError>;
}

pub type SharedOrderApi = Arc<dyn OrderApi>;

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(rename = "orderNumber")]
    order_number: Option<String>,
}

/// JSON client for the merchant ordering API.
pub struct HttpOrderApi {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HttpOrderApi {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(SUBMIT_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn submit(&self, submission: &OrderSubmission) -> Result<String, OrderSubmitError> {
        submission.validate()?;
        if self.api_base.is_empty() {
            return Err(OrderSubmitError::ConfigMissing);
        }
        let url = format!(
            "{}/merchants/{}/orders",
            self.api_base.trim_end_matches('/'),
            submission.merchant_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(submission)
            .send()
            .await
            .map_err(|err| OrderSubmitError::ApiError(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OrderSubmitError::MerchantNotConfigured);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(OrderSubmitError::ApiError(format!("{status}: {detail}")));
        }
        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|err| OrderSubmitError::ApiError(err.to_string()))?;
        parsed
            .order_number
            .ok_or_else(|| OrderSubmitError::ApiError("missing orderNumber".into()))
    }
}

/// Test double: sequential order numbers, optionally failing first.
#[derive(Default)]
pub struct InMemoryOrderApi {
    next: AtomicU64,
    fail_with: Mutex<Option<OrderSubmitError>>,
    submitted: Mutex<Vec<OrderSubmission>>,
}

impl InMemoryOrderApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next(&self, err: OrderSubmitError) {
        *self.fail_with.lock().await = Some(err);
    }

    pub async fn submissions(&self) -> Vec<OrderSubmission> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl OrderApi for InMemoryOrderApi {
    async fn submit(&self, submission: &OrderSubmission) -> Result<String, OrderSubmitError> {
        submission.validate()?;
        if let Some(err) = self.fail_with.lock().await.take() {
            return Err(err);
        }
        self.submitted.lock().await.push(submission.clone());
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{:04}", n + 41))
    }
}
