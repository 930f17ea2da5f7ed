//! Durable store: the single source of truth for tenants, conversations,
//! messages, orders, sessions, quotas, and the template cache.
//!
//! Backed by sqlite behind a blocking-safe connection handle; every public
//! operation is async and runs its SQL on the blocking pool. In-memory
//! caches (tenant registry) are derived state with short TTLs.

mod audit;
mod conversations;
mod messages;
mod orders;
mod registry;
mod schema;
mod sessions;
mod state;
mod template_cache;
mod tenants;

use std::{
    path::Path,
    sync::{Arc, Mutex as StdMutex},
};

use rusqlite::Connection;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

pub use audit::{LogSeverity, WebhookLogEntry};
pub use conversations::ConversationRow;
pub use messages::{MessageRow, NewInbound, NewOutbound};
pub use orders::{NewOrder, OrderRow};
pub use registry::{RegistryError, TenantRegistry};
pub use sessions::{QuotaStatus, SessionTouch};
pub use template_cache::CachedPayload;
pub use tenants::NewTenant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no tenant is bound to {0}")]
    TenantNotFound(String),
    #[error("tenant {0} is inactive")]
    TenantInactive(String),
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("invalid order transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub(crate) fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Internal(anyhow::Error::new(err))
    }
}

/// Shared handle over the sqlite database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<StdMutex<Connection>>,
}

impl Store {
    /// Opens (and migrates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Fresh in-memory database, used by tests and local development.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    /// Runs `func` against the connection on the blocking pool.
    pub(crate) async fn with_conn<F, T>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            func(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Internal(err.into()))?
    }
}

/// Formats an instant the way every table stores it.
pub(crate) fn fmt_ts(ts: OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

pub(crate) fn parse_ts(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
}

/// True when `err` is a sqlite uniqueness violation; used by the idempotent
/// insert paths.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use wg_core::testkit;

    /// In-memory store pre-seeded with one active tenant `t1`.
    pub async fn store_with_tenant() -> (Store, wg_core::Tenant) {
        let store = Store::open_in_memory().expect("open in-memory store");
        let tenant = testkit::tenant("t1");
        store
            .insert_tenant(NewTenant::from_tenant(&tenant))
            .await
            .expect("seed tenant");
        (store, tenant)
    }
}
