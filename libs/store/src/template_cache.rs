//! Cached template payloads, consumed when the customer clicks the
//! template's quick-reply button.

use rusqlite::{params, OptionalExtension};
use time::{Duration, OffsetDateTime};
use wg_core::phone::PhoneNumber;
use wg_core::types::new_id;

use crate::{fmt_ts, Store, StoreError};

const CACHE_TTL_HOURS: i64 = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
    pub id: String,
    pub template_sid: String,
    pub payload: String,
}

impl Store {
    /// Stores the rich body the customer would receive on click. Newer
    /// entries supersede older unconsumed ones at read time because consume
    /// always takes the most recent row.
    pub async fn cache_template_payload(
        &self,
        tenant_id: &str,
        customer_wa: &PhoneNumber,
        template_sid: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let tenant_id = tenant_id.to_string();
        let customer = customer_wa.as_str().to_string();
        let template_sid = template_sid.to_string();
        let payload = payload.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO template_cache
                     (id, tenant_id, customer_wa, template_sid, payload, delivered, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
                params![
                    new_id(),
                    tenant_id,
                    customer,
                    template_sid,
                    payload,
                    fmt_ts(now),
                    fmt_ts(now + Duration::hours(CACHE_TTL_HOURS)),
                ],
            )
            .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
    }

    /// Returns the newest non-expired, undelivered payload and marks it
    /// delivered. Delivery is terminal; expiry is strict at 48h.
    pub async fn consume_cached_payload(
        &self,
        tenant_id: &str,
        customer_wa: &PhoneNumber,
        now: OffsetDateTime,
    ) -> Result<Option<CachedPayload>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let customer = customer_wa.as_str().to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StoreError::internal)?;
            let hit = tx
                .query_row(
                    "SELECT id, template_sid, payload FROM template_cache
                     WHERE tenant_id = ?1 AND customer_wa = ?2
                       AND delivered = 0 AND expires_at > ?3
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![tenant_id, customer, fmt_ts(now)],
                    |row| {
                        Ok(CachedPayload {
                            id: row.get(0)?,
                            template_sid: row.get(1)?,
                            payload: row.get(2)?,
                        })
                    },
                )
                .optional()
                .map_err(StoreError::internal)?;

            if let Some(entry) = &hit {
                tx.execute(
                    "UPDATE template_cache SET delivered = 1 WHERE id = ?1",
                    params![entry.id],
                )
                .map_err(StoreError::internal)?;
            }
            tx.commit().map_err(StoreError::internal)?;
            Ok(hit)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store_with_tenant;
    use wg_core::testkit;

    #[tokio::test]
    async fn newest_payload_wins() {
        let (store, _) = store_with_tenant().await;
        let customer = testkit::phone("+201000000001");
        let now = OffsetDateTime::now_utc();

        store
            .cache_template_payload("t1", &customer, "HXorder", "Order #41", now - Duration::minutes(5))
            .await
            .unwrap();
        store
            .cache_template_payload("t1", &customer, "HXorder", "Order #42 ready", now)
            .await
            .unwrap();

        let hit = store
            .consume_cached_payload("t1", &customer, now)
            .await
            .unwrap()
            .expect("cached payload");
        assert_eq!(hit.payload, "Order #42 ready");
    }

    #[tokio::test]
    async fn delivery_is_terminal() {
        let (store, _) = store_with_tenant().await;
        let customer = testkit::phone("+201000000001");
        let now = OffsetDateTime::now_utc();
        store
            .cache_template_payload("t1", &customer, "HXorder", "Order #42", now)
            .await
            .unwrap();

        assert!(store
            .consume_cached_payload("t1", &customer, now)
            .await
            .unwrap()
            .is_some());
        // Second click finds nothing; the older consumed row stays consumed.
        assert!(store
            .consume_cached_payload("t1", &customer, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expiry_boundary_is_strict() {
        let (store, _) = store_with_tenant().await;
        let customer = testkit::phone("+201000000001");
        let cached_at = OffsetDateTime::now_utc() - Duration::hours(48);
        store
            .cache_template_payload("t1", &customer, "HXorder", "stale", cached_at)
            .await
            .unwrap();

        let at_boundary = store
            .consume_cached_payload("t1", &customer, cached_at + Duration::hours(48))
            .await
            .unwrap();
        assert!(at_boundary.is_none());
    }

    #[tokio::test]
    async fn scoped_per_customer() {
        let (store, _) = store_with_tenant().await;
        let a = testkit::phone("+201000000001");
        let b = testkit::phone("+201000000002");
        let now = OffsetDateTime::now_utc();
        store
            .cache_template_payload("t1", &a, "HXorder", "for a", now)
            .await
            .unwrap();
        assert!(store
            .consume_cached_payload("t1", &b, now)
            .await
            .unwrap()
            .is_none());
    }
}
