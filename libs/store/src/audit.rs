//! Append-only webhook audit trail.

use rusqlite::params;
use time::OffsetDateTime;
use wg_core::types::new_id;

use crate::{fmt_ts, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
    Security,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Info => "INFO",
            LogSeverity::Warn => "WARN",
            LogSeverity::Error => "ERROR",
            LogSeverity::Security => "SECURITY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookLogEntry {
    pub tenant_id: Option<String>,
    pub digest: String,
    pub status_code: u16,
    pub severity: LogSeverity,
}

impl Store {
    pub async fn log_webhook(
        &self,
        entry: WebhookLogEntry,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO webhook_logs (id, tenant_id, digest, status_code, severity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new_id(),
                    entry.tenant_id,
                    entry.digest,
                    i64::from(entry.status_code),
                    entry.severity.as_str(),
                    fmt_ts(now),
                ],
            )
            .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn webhook_log_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM webhook_logs", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(StoreError::internal)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store_with_tenant;

    #[tokio::test]
    async fn appends_with_and_without_tenant() {
        let (store, _) = store_with_tenant().await;
        store
            .log_webhook(
                WebhookLogEntry {
                    tenant_id: None,
                    digest: "abc".into(),
                    status_code: 404,
                    severity: LogSeverity::Error,
                },
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        store
            .log_webhook(
                WebhookLogEntry {
                    tenant_id: Some("t1".into()),
                    digest: "def".into(),
                    status_code: 200,
                    severity: LogSeverity::Info,
                },
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        assert_eq!(store.webhook_log_count().await.unwrap(), 2);
    }
}
