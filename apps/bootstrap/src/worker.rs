//! Prefetch execution: bounded parallelism, per-tenant pacing, silent
//! bounded retries. Nothing here is ever user-visible.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use wg_core::catalog::SharedCatalog;
use wg_core::types::BootstrapJob;
use wg_ratelimit::{Bucket, RateLimiter};
use wg_store::TenantRegistry;

use crate::config::BootstrapConfig;

#[derive(Clone)]
pub struct BootstrapWorker {
    registry: TenantRegistry,
    catalog: SharedCatalog,
    limiter: RateLimiter,
    slots: Arc<Semaphore>,
    config: BootstrapConfig,
}

impl BootstrapWorker {
    pub fn new(
        registry: TenantRegistry,
        catalog: SharedCatalog,
        limiter: RateLimiter,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            limiter,
            slots: Arc::new(Semaphore::new(config.parallelism)),
            config,
        }
    }

    /// Runs one job to completion. Always returns; failures are retried up
    /// to the budget and then dropped with a log line.
    pub async fn process(&self, job: BootstrapJob) {
        let _permit = self
            .slots
            .acquire()
            .await
            .expect("bootstrap semaphore never closes");

        // 20 jobs/min per tenant; denials wait out the window.
        loop {
            match self
                .limiter
                .check(&Bucket::bootstrap(&job.tenant_id), self.config.jobs_per_minute)
                .await
            {
                Ok(decision) if decision.is_allowed() => break,
                Ok(decision) => tokio::time::sleep(decision.retry_after()).await,
                Err(err) => {
                    warn!(error = %err, "bootstrap pacing check failed; proceeding");
                    break;
                }
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.prefetch(&job).await {
                Ok(()) => {
                    metrics::counter!("bootstrap_completed", "tenant" => job.tenant_id.clone())
                        .increment(1);
                    info!(tenant = %job.tenant_id, customer = %job.customer_wa, "bootstrap prefetch complete");
                    return;
                }
                Err(err) if attempt < self.config.max_attempts => {
                    let delay = backoff(self.config.base_backoff, attempt);
                    debug!(error = %err, attempt, "bootstrap prefetch failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(error = %err, tenant = %job.tenant_id, "bootstrap prefetch abandoned");
                    metrics::counter!("bootstrap_failed", "tenant" => job.tenant_id.clone())
                        .increment(1);
                    return;
                }
            }
        }
    }

    /// Warms menu categories, the first category's items, the branch list,
    /// and the tenant (template descriptors included) in the registry cache.
    async fn prefetch(&self, job: &BootstrapJob) -> anyhow::Result<()> {
        let tenant = self.registry.load(&job.tenant_id).await?;
        let Some(merchant) = tenant.merchant_id.as_deref() else {
            // Nothing to warm; not an error.
            return Ok(());
        };

        let categories = self.catalog.categories(merchant).await?;
        if let Some(first) = categories.first() {
            let _ = self.catalog.items(merchant, &first.id).await?;
        }
        let _ = self.catalog.branches(merchant).await?;
        Ok(())
    }
}

fn backoff(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    let mut rng = rand::rng();
    let factor = 1.0 + rng.random_range(-0.2..=0.2);
    std::time::Duration::from_secs_f64(exp * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wg_core::catalog::{CatalogClient, CatalogError, InMemoryCatalog, MenuCategory, MenuItem};
    use wg_core::testkit;
    use wg_core::types::BranchRef;
    use wg_ratelimit::InMemoryRateStore;
    use wg_store::Store;

    struct CountingCatalog {
        inner: InMemoryCatalog,
        calls: AtomicU32,
        fail_first: AtomicU32,
    }

    #[async_trait]
    impl CatalogClient for CountingCatalog {
        async fn categories(&self, merchant_id: &str) -> Result<Vec<MenuCategory>, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CatalogError::Request(anyhow::anyhow!("upstream 500")));
            }
            self.inner.categories(merchant_id).await
        }

        async fn items(
            &self,
            merchant_id: &str,
            category_id: &str,
        ) -> Result<Vec<MenuItem>, CatalogError> {
            self.inner.items(merchant_id, category_id).await
        }

        async fn branches(&self, merchant_id: &str) -> Result<Vec<BranchRef>, CatalogError> {
            self.inner.branches(merchant_id).await
        }
    }

    async fn worker(fail_first: u32) -> (BootstrapWorker, Arc<CountingCatalog>) {
        let store = Store::open_in_memory().unwrap();
        let tenant = testkit::tenant("t1");
        store
            .insert_tenant(wg_store::NewTenant::from_tenant(&tenant))
            .await
            .unwrap();

        let catalog = CountingCatalog {
            inner: InMemoryCatalog::new(),
            calls: AtomicU32::new(0),
            fail_first: AtomicU32::new(fail_first),
        };
        let merchant = tenant.merchant_id.as_deref().unwrap();
        catalog
            .inner
            .put_categories(
                merchant,
                vec![MenuCategory {
                    id: "cat_1".into(),
                    name: "برجر".into(),
                }],
            )
            .await;
        catalog.inner.put_items(merchant, "cat_1", vec![]).await;
        catalog.inner.put_branches(merchant, vec![]).await;

        let catalog = Arc::new(catalog);
        let worker = BootstrapWorker::new(
            TenantRegistry::new(store),
            catalog.clone(),
            RateLimiter::new(Arc::new(InMemoryRateStore::new())),
            BootstrapConfig::for_tests(),
        );
        (worker, catalog)
    }

    fn job() -> BootstrapJob {
        BootstrapJob {
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            customer_wa: testkit::phone("+201000000001"),
        }
    }

    #[tokio::test]
    async fn prefetch_succeeds_first_try() {
        let (worker, catalog) = worker(0).await;
        worker.process(job()).await;
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (worker, catalog) = worker(2).await;
        worker.process(job()).await;
        // Two failures plus the success.
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget_without_error() {
        let (worker, catalog) = worker(10).await;
        worker.process(job()).await;
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn repeat_jobs_are_idempotent() {
        let (worker, catalog) = worker(0).await;
        worker.process(job()).await;
        worker.process(job()).await;
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    }
}
