//! Cached tenant resolution for the hot webhook path.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use wg_core::phone::PhoneNumber;
use wg_core::types::Tenant;

use crate::{Store, StoreError};

/// Resolutions are cached briefly; writes invalidate, and peers learn about
/// writes through the `wa.admin.invalidate` fan-out.
pub const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no tenant is bound to {0}")]
    NotFound(String),
    #[error("tenant for {0} is inactive")]
    Inactive(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
struct CachedTenant {
    tenant: Tenant,
    inserted_at: Instant,
}

#[derive(Clone)]
pub struct TenantRegistry {
    store: Store,
    cache: std::sync::Arc<DashMap<String, CachedTenant>>,
    ttl: Duration,
}

impl TenantRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: std::sync::Arc::new(DashMap::new()),
            ttl: CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(store: Store, ttl: Duration) -> Self {
        Self {
            store,
            cache: std::sync::Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Resolves the destination number to its active tenant.
    pub async fn resolve_by_destination(
        &self,
        destination: &PhoneNumber,
    ) -> Result<Tenant, RegistryError> {
        let key = destination.as_str().to_string();
        if let Some(hit) = self.cache.get(&key) {
            if hit.inserted_at.elapsed() < self.ttl {
                let tenant = hit.tenant.clone();
                drop(hit);
                return Self::gate(tenant, destination);
            }
            drop(hit);
            self.cache.remove(&key);
        }

        let tenant = self
            .store
            .tenant_by_destination(destination)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        self.cache.insert(
            key,
            CachedTenant {
                tenant: tenant.clone(),
                inserted_at: Instant::now(),
            },
        );
        Self::gate(tenant, destination)
    }

    fn gate(tenant: Tenant, destination: &PhoneNumber) -> Result<Tenant, RegistryError> {
        if !tenant.accepts_traffic() {
            return Err(RegistryError::Inactive(destination.as_str().to_string()));
        }
        Ok(tenant)
    }

    pub async fn load(&self, id: &str) -> Result<Tenant, RegistryError> {
        self.store
            .tenant_by_id(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn update_credentials(
        &self,
        id: &str,
        account_sid: &str,
        auth_token: &str,
    ) -> Result<(), RegistryError> {
        self.store
            .update_tenant_credentials(id, account_sid, auth_token)
            .await?;
        self.invalidate_all();
        Ok(())
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<(), RegistryError> {
        self.store.set_tenant_active(id, active).await?;
        self.invalidate_all();
        Ok(())
    }

    /// Drops every cached resolution; wired to `wa.admin.invalidate`.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}
