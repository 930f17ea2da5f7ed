//! Order rows with monotonic status transitions.

use rusqlite::{params, OptionalExtension, Row};
use time::OffsetDateTime;
use wg_core::types::{
    new_id, BranchRef, DeliveryAddress, OrderItem, OrderStatus, OrderType, PaymentMethod,
};

use crate::{fmt_ts, parse_ts, Store, StoreError};

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: String,
    pub conversation_id: String,
    pub tenant_id: String,
    pub external_no: Option<String>,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub items: Vec<OrderItem>,
    pub subtotal_minor: i64,
    pub total_minor: i64,
    pub currency: String,
    pub address: Option<DeliveryAddress>,
    pub branch: Option<BranchRef>,
    pub payment_method: Option<PaymentMethod>,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub conversation_id: String,
    pub tenant_id: String,
    pub order_type: OrderType,
    pub items: Vec<OrderItem>,
    pub total_minor: i64,
    pub currency: String,
    pub address: Option<DeliveryAddress>,
    pub branch: Option<BranchRef>,
    pub payment_method: Option<PaymentMethod>,
    pub at: OffsetDateTime,
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<OrderRow> {
    let status: String = row.get("status")?;
    let order_type: String = row.get("order_type")?;
    let items: String = row.get("items")?;
    let address: Option<String> = row.get("address")?;
    let branch: Option<String> = row.get("branch")?;
    let payment: Option<String> = row.get("payment_method")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(OrderRow {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        tenant_id: row.get("tenant_id")?,
        external_no: row.get("external_no")?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Draft),
        order_type: OrderType::parse(&order_type).unwrap_or(OrderType::Delivery),
        items: serde_json::from_str(&items).unwrap_or_default(),
        subtotal_minor: row.get("subtotal_minor")?,
        total_minor: row.get("total_minor")?,
        currency: row.get("currency")?,
        address: address.and_then(|raw| serde_json::from_str(&raw).ok()),
        branch: branch.and_then(|raw| serde_json::from_str(&raw).ok()),
        payment_method: payment.as_deref().and_then(|p| match p {
            "online" => Some(PaymentMethod::Online),
            "cash" => Some(PaymentMethod::Cash),
            _ => None,
        }),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

impl Store {
    /// Creates a DRAFT order from the assembled checkout.
    pub async fn insert_order(&self, new: NewOrder) -> Result<OrderRow, StoreError> {
        self.with_conn(move |conn| {
            let id = new_id();
            let at = fmt_ts(new.at);
            let items = serde_json::to_string(&new.items).map_err(StoreError::internal)?;
            let subtotal: i64 = new.items.iter().map(OrderItem::line_total_minor).sum();
            let address = new
                .address
                .as_ref()
                .map(|a| serde_json::to_string(a))
                .transpose()
                .map_err(StoreError::internal)?;
            let branch = new
                .branch
                .as_ref()
                .map(|b| serde_json::to_string(b))
                .transpose()
                .map_err(StoreError::internal)?;
            conn.execute(
                "INSERT INTO orders (id, conversation_id, tenant_id, status, order_type,
                     items, subtotal_minor, total_minor, currency, address, branch,
                     payment_method, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'DRAFT', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    id,
                    new.conversation_id,
                    new.tenant_id,
                    new.order_type.as_str(),
                    items,
                    subtotal,
                    new.total_minor,
                    new.currency,
                    address,
                    branch,
                    new.payment_method.map(|p| p.as_str()),
                    at,
                ],
            )
            .map_err(StoreError::internal)?;
            conn.query_row("SELECT * FROM orders WHERE id = ?1", params![id], order_from_row)
                .map_err(StoreError::internal)
        })
        .await
    }

    pub async fn order_by_id(&self, id: &str) -> Result<Option<OrderRow>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM orders WHERE id = ?1", params![id], order_from_row)
                .optional()
                .map_err(StoreError::internal)
        })
        .await
    }

    /// Records the merchant's order number and payment method once
    /// submission succeeds, and confirms the order.
    pub async fn confirm_order(
        &self,
        id: &str,
        external_no: &str,
        payment: PaymentMethod,
        now: OffsetDateTime,
    ) -> Result<OrderRow, StoreError> {
        let id = id.to_string();
        let external = external_no.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE orders SET external_no = ?2, status = 'CONFIRMED',
                         payment_method = ?3, updated_at = ?4
                     WHERE id = ?1 AND status = 'DRAFT'",
                    params![id, external, payment.as_str(), fmt_ts(now)],
                )
                .map_err(StoreError::internal)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("draft order {id}")));
            }
            conn.query_row("SELECT * FROM orders WHERE id = ?1", params![id], order_from_row)
                .map_err(StoreError::internal)
        })
        .await
    }

    /// Monotonic status transition; CANCELLED is reachable from any
    /// non-terminal state.
    pub async fn transition_order(
        &self,
        id: &str,
        next: OrderStatus,
        now: OffsetDateTime,
    ) -> Result<OrderRow, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let current = conn
                .query_row("SELECT * FROM orders WHERE id = ?1", params![id], order_from_row)
                .optional()
                .map_err(StoreError::internal)?
                .ok_or_else(|| StoreError::NotFound(format!("order {id}")))?;
            if !current.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: current.status.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            conn.execute(
                "UPDATE orders SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, next.as_str(), fmt_ts(now)],
            )
            .map_err(StoreError::internal)?;
            conn.query_row("SELECT * FROM orders WHERE id = ?1", params![id], order_from_row)
                .map_err(StoreError::internal)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store_with_tenant;
    use wg_core::testkit;

    async fn draft(store: &Store) -> OrderRow {
        let customer = testkit::phone("+201000000001");
        let conv = store
            .upsert_conversation("t1", &customer, OffsetDateTime::now_utc())
            .await
            .unwrap();
        store
            .insert_order(NewOrder {
                conversation_id: conv.id,
                tenant_id: "t1".into(),
                order_type: OrderType::Delivery,
                items: vec![OrderItem {
                    item_id: "item_1".into(),
                    name: "برجر".into(),
                    quantity: 2,
                    unit_price_minor: 1500,
                }],
                total_minor: 3000,
                currency: "SAR".into(),
                address: Some(DeliveryAddress {
                    latitude: 24.7,
                    longitude: 46.6,
                    address: "الرياض".into(),
                }),
                branch: None,
                payment_method: None,
                at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn draft_confirm_and_track() {
        let (store, _) = store_with_tenant().await;
        let order = draft(&store).await;
        assert_eq!(order.status, OrderStatus::Draft);
        assert_eq!(order.subtotal_minor, 3000);

        let confirmed = store
            .confirm_order(&order.id, "4242", PaymentMethod::Cash, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(confirmed.external_no.as_deref(), Some("4242"));

        let preparing = store
            .transition_order(&order.id, OrderStatus::Preparing, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(preparing.status, OrderStatus::Preparing);
    }

    #[tokio::test]
    async fn backwards_transition_is_rejected() {
        let (store, _) = store_with_tenant().await;
        let order = draft(&store).await;
        store
            .confirm_order(&order.id, "1", PaymentMethod::Online, OffsetDateTime::now_utc())
            .await
            .unwrap();
        store
            .transition_order(&order.id, OrderStatus::Preparing, OffsetDateTime::now_utc())
            .await
            .unwrap();
        let err = store
            .transition_order(&order.id, OrderStatus::Confirmed, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_allowed_until_delivered() {
        let (store, _) = store_with_tenant().await;
        let order = draft(&store).await;
        store
            .confirm_order(&order.id, "1", PaymentMethod::Online, OffsetDateTime::now_utc())
            .await
            .unwrap();
        let cancelled = store
            .transition_order(&order.id, OrderStatus::Cancelled, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        let err = store
            .transition_order(&order.id, OrderStatus::Preparing, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
}
