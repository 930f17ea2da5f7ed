//! Conversation rows, unique per (tenant, customer).

use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use wg_core::phone::PhoneNumber;
use wg_core::types::new_id;

use crate::{fmt_ts, parse_ts, Store, StoreError};

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub tenant_id: String,
    pub customer_wa: PhoneNumber,
    pub is_bot_active: bool,
    pub unread_count: u32,
    pub last_message_at: Option<OffsetDateTime>,
    pub created_at: Option<OffsetDateTime>,
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    let customer: String = row.get("customer_wa")?;
    let last: Option<String> = row.get("last_message_at")?;
    let created: String = row.get("created_at")?;
    Ok(ConversationRow {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        customer_wa: wg_core::phone::normalize(&customer).map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "customer_wa".into(), rusqlite::types::Type::Text)
        })?,
        is_bot_active: row.get::<_, i64>("is_bot_active")? != 0,
        unread_count: row.get::<_, i64>("unread_count")? as u32,
        last_message_at: last.as_deref().and_then(parse_ts),
        created_at: parse_ts(&created),
    })
}

pub(crate) fn select_conversation(
    conn: &Connection,
    tenant_id: &str,
    customer_wa: &str,
) -> Result<Option<ConversationRow>, StoreError> {
    conn.query_row(
        "SELECT * FROM conversations WHERE tenant_id = ?1 AND customer_wa = ?2",
        params![tenant_id, customer_wa],
        conversation_from_row,
    )
    .optional()
    .map_err(StoreError::internal)
}

impl Store {
    /// Creates the conversation on first contact, otherwise returns the
    /// existing row untouched.
    pub async fn upsert_conversation(
        &self,
        tenant_id: &str,
        customer_wa: &PhoneNumber,
        now: OffsetDateTime,
    ) -> Result<ConversationRow, StoreError> {
        let tenant_id = tenant_id.to_string();
        let customer = customer_wa.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, tenant_id, customer_wa, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (tenant_id, customer_wa) DO NOTHING",
                params![new_id(), tenant_id, customer, fmt_ts(now)],
            )
            .map_err(StoreError::internal)?;
            select_conversation(conn, &tenant_id, &customer)?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {tenant_id}/{customer}")))
        })
        .await
    }

    pub async fn conversation_by_id(&self, id: &str) -> Result<Option<ConversationRow>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .optional()
            .map_err(StoreError::internal)
        })
        .await
    }

    pub async fn conversation_by_customer(
        &self,
        tenant_id: &str,
        customer_wa: &PhoneNumber,
    ) -> Result<Option<ConversationRow>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let customer = customer_wa.as_str().to_string();
        self.with_conn(move |conn| select_conversation(conn, &tenant_id, &customer))
            .await
    }

    /// Handover toggles this off; the bot ignores the conversation until an
    /// agent re-enables it.
    pub async fn set_conversation_bot_active(
        &self,
        conversation_id: &str,
        active: bool,
    ) -> Result<(), StoreError> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE conversations SET is_bot_active = ?2 WHERE id = ?1",
                    params![id, active as i64],
                )
                .map_err(StoreError::internal)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), StoreError> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conversations SET unread_count = 0 WHERE id = ?1",
                params![id],
            )
            .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
    }
}
