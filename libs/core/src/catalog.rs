//! Merchant catalog interface (menu categories, items, branches).
//!
//! Catalog data lives in an external merchant platform; the core only
//! consumes it through this trait. The bootstrap worker warms it, the flow
//! engine browses it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::BranchRef;

const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuCategory {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub category_id: String,
    pub name: String,
    pub price_minor: i64,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("merchant {0} is not configured")]
    MerchantNotConfigured(String),
    #[error("catalog request failed: {0}")]
    Request(#[source] anyhow::Error),
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn categories(&self, merchant_id: &str) -> Result<Vec<MenuCategory>, CatalogError>;
    async fn items(
        &self,
        merchant_id: &str,
        category_id: &str,
    ) -> Result<Vec<MenuItem>, CatalogError>;
    async fn branches(&self, merchant_id: &str) -> Result<Vec<BranchRef>, CatalogError>;
}

pub type SharedCatalog = Arc<dyn CatalogClient>;

/// JSON client for the merchant platform.
pub struct HttpCatalogClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HttpCatalogClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(CATALOG_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            api_key: api_key.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, CatalogError> {
        let url = format!("{}{}", self.api_base.trim_end_matches('/'), path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| CatalogError::Request(anyhow::Error::new(err)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CatalogError::MerchantNotConfigured(url));
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(CatalogError::Request(anyhow::anyhow!(
                "catalog returned {status} for {url}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| CatalogError::Request(anyhow::Error::new(err)))
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn categories(&self, merchant_id: &str) -> Result<Vec<MenuCategory>, CatalogError> {
        self.get_json(&format!("/merchants/{merchant_id}/categories"))
            .await
    }

    async fn items(
        &self,
        merchant_id: &str,
        category_id: &str,
    ) -> Result<Vec<MenuItem>, CatalogError> {
        self.get_json(&format!(
            "/merchants/{merchant_id}/categories/{category_id}/items"
        ))
        .await
    }

    async fn branches(&self, merchant_id: &str) -> Result<Vec<BranchRef>, CatalogError> {
        self.get_json(&format!("/merchants/{merchant_id}/branches"))
            .await
    }
}

/// In-memory catalog used by flow/bootstrap tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    inner: RwLock<CatalogData>,
}

#[derive(Default)]
struct CatalogData {
    categories: HashMap<String, Vec<MenuCategory>>,
    items: HashMap<(String, String), Vec<MenuItem>>,
    branches: HashMap<String, Vec<BranchRef>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_categories(&self, merchant_id: &str, categories: Vec<MenuCategory>) {
        self.inner
            .write()
            .await
            .categories
            .insert(merchant_id.to_string(), categories);
    }

    pub async fn put_items(&self, merchant_id: &str, category_id: &str, items: Vec<MenuItem>) {
        self.inner
            .write()
            .await
            .items
            .insert((merchant_id.to_string(), category_id.to_string()), items);
    }

    pub async fn put_branches(&self, merchant_id: &str, branches: Vec<BranchRef>) {
        self.inner
            .write()
            .await
            .branches
            .insert(merchant_id.to_string(), branches);
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn categories(&self, merchant_id: &str) -> Result<Vec<MenuCategory>, CatalogError> {
        self.inner
            .read()
            .await
            .categories
            .get(merchant_id)
            .cloned()
            .ok_or_else(|| CatalogError::MerchantNotConfigured(merchant_id.to_string()))
    }

    async fn items(
        &self,
        merchant_id: &str,
        category_id: &str,
    ) -> Result<Vec<MenuItem>, CatalogError> {
        Ok(self
            .inner
            .read()
            .await
            .items
            .get(&(merchant_id.to_string(), category_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn branches(&self, merchant_id: &str) -> Result<Vec<BranchRef>, CatalogError> {
        self.inner
            .read()
            .await
            .branches
            .get(merchant_id)
            .cloned()
            .ok_or_else(|| CatalogError::MerchantNotConfigured(merchant_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_catalog_round_trip() {
        let catalog = InMemoryCatalog::new();
        catalog
            .put_categories(
                "m1",
                vec![MenuCategory {
                    id: "cat_1".into(),
                    name: "مشويات".into(),
                }],
            )
            .await;

        let cats = catalog.categories("m1").await.unwrap();
        assert_eq!(cats.len(), 1);
        assert!(matches!(
            catalog.categories("m2").await,
            Err(CatalogError::MerchantNotConfigured(_))
        ));
    }
}
