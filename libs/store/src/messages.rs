//! Message rows and the 24-hour messaging-window query.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use wg_core::phone::PhoneNumber;
use wg_core::types::{new_id, Channel, Direction, MessageKind, TemplateDescriptor};

use crate::{fmt_ts, is_unique_violation, parse_ts, Store, StoreError};

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub tenant_id: String,
    pub direction: Direction,
    pub provider_sid: Option<String>,
    pub channel: Channel,
    pub kind: MessageKind,
    pub body: String,
    pub media_url: Option<String>,
    pub template_sid: Option<String>,
    pub template_name: Option<String>,
    pub metadata: Value,
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewInbound {
    pub conversation_id: String,
    pub tenant_id: String,
    pub provider_sid: String,
    pub kind: MessageKind,
    pub body: String,
    pub media_url: Option<String>,
    pub metadata: Value,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewOutbound {
    pub conversation_id: String,
    pub tenant_id: String,
    pub provider_sid: String,
    pub channel: Channel,
    pub kind: MessageKind,
    pub body: String,
    pub template: Option<TemplateDescriptor>,
    pub at: OffsetDateTime,
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let direction: String = row.get("direction")?;
    let channel: String = row.get("channel")?;
    let kind: String = row.get("kind")?;
    let metadata: String = row.get("metadata")?;
    let created: String = row.get("created_at")?;
    Ok(MessageRow {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        tenant_id: row.get("tenant_id")?,
        direction: if direction == "IN" {
            Direction::In
        } else {
            Direction::Out
        },
        provider_sid: row.get("provider_sid")?,
        channel: if channel == "template" {
            Channel::Template
        } else {
            Channel::Freeform
        },
        kind: MessageKind::parse(&kind).unwrap_or(MessageKind::Text),
        body: row.get("body")?,
        media_url: row.get("media_url")?,
        template_sid: row.get("template_sid")?,
        template_name: row.get("template_name")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at: parse_ts(&created),
    })
}

fn select_by_sid(conn: &Connection, sid: &str) -> Result<Option<MessageRow>, StoreError> {
    conn.query_row(
        "SELECT * FROM messages WHERE provider_sid = ?1",
        params![sid],
        message_from_row,
    )
    .optional()
    .map_err(StoreError::internal)
}

/// Moves `last_message_at` forward only.
fn touch_conversation(
    conn: &Connection,
    conversation_id: &str,
    at: &str,
    bump_unread: bool,
) -> Result<(), StoreError> {
    let unread = if bump_unread { 1 } else { 0 };
    conn.execute(
        "UPDATE conversations
         SET unread_count = unread_count + ?2,
             last_message_at = CASE
                 WHEN last_message_at IS NULL OR last_message_at < ?3 THEN ?3
                 ELSE last_message_at
             END
         WHERE id = ?1",
        params![conversation_id, unread, at],
    )
    .map_err(StoreError::internal)?;
    Ok(())
}

impl Store {
    /// Persists an inbound message. Returns `(row, created)`; a duplicate
    /// provider sid yields the existing row with `created = false`.
    pub async fn create_inbound(
        &self,
        new: NewInbound,
    ) -> Result<(MessageRow, bool), StoreError> {
        self.with_conn(move |conn| {
            let at = fmt_ts(new.at);
            let metadata =
                serde_json::to_string(&new.metadata).unwrap_or_else(|_| "{}".to_string());
            let tx = conn.transaction().map_err(StoreError::internal)?;
            let id = new_id();
            let inserted = tx.execute(
                "INSERT INTO messages (id, conversation_id, tenant_id, direction,
                     provider_sid, channel, kind, body, media_url, metadata, created_at)
                 VALUES (?1, ?2, ?3, 'IN', ?4, 'freeform', ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    new.conversation_id,
                    new.tenant_id,
                    new.provider_sid,
                    new.kind.as_str(),
                    new.body,
                    new.media_url,
                    metadata,
                    at,
                ],
            );
            match inserted {
                Ok(_) => {
                    touch_conversation(&tx, &new.conversation_id, &at, true)?;
                    tx.commit().map_err(StoreError::internal)?;
                }
                Err(err) if is_unique_violation(&err) => {
                    drop(tx);
                    let existing = select_by_sid(conn, &new.provider_sid)?.ok_or_else(|| {
                        StoreError::NotFound(format!("message sid {}", new.provider_sid))
                    })?;
                    return Ok((existing, false));
                }
                Err(err) => return Err(StoreError::internal(err)),
            }
            let row = select_by_sid(conn, &new.provider_sid)?
                .ok_or_else(|| StoreError::NotFound(format!("message sid {}", new.provider_sid)))?;
            Ok((row, true))
        })
        .await
    }

    /// Persists an outbound message idempotently on the provider sid.
    pub async fn create_outbound(
        &self,
        new: NewOutbound,
    ) -> Result<(MessageRow, bool), StoreError> {
        self.with_conn(move |conn| {
            let at = fmt_ts(new.at);
            let tx = conn.transaction().map_err(StoreError::internal)?;
            let inserted = tx.execute(
                "INSERT INTO messages (id, conversation_id, tenant_id, direction,
                     provider_sid, channel, kind, body, template_sid, template_name, created_at)
                 VALUES (?1, ?2, ?3, 'OUT', ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    new_id(),
                    new.conversation_id,
                    new.tenant_id,
                    new.provider_sid,
                    new.channel.as_str(),
                    new.kind.as_str(),
                    new.body,
                    new.template.as_ref().map(|t| t.sid.clone()),
                    new.template.as_ref().map(|t| t.friendly_name.clone()),
                    at,
                ],
            );
            match inserted {
                Ok(_) => {
                    touch_conversation(&tx, &new.conversation_id, &at, false)?;
                    tx.commit().map_err(StoreError::internal)?;
                }
                Err(err) if is_unique_violation(&err) => {
                    drop(tx);
                    let existing = select_by_sid(conn, &new.provider_sid)?.ok_or_else(|| {
                        StoreError::NotFound(format!("message sid {}", new.provider_sid))
                    })?;
                    return Ok((existing, false));
                }
                Err(err) => return Err(StoreError::internal(err)),
            }
            let row = select_by_sid(conn, &new.provider_sid)?
                .ok_or_else(|| StoreError::NotFound(format!("message sid {}", new.provider_sid)))?;
            Ok((row, true))
        })
        .await
    }

    /// Timestamp of the newest inbound from this customer, any kind.
    pub async fn latest_inbound_at(
        &self,
        tenant_id: &str,
        customer_wa: &PhoneNumber,
    ) -> Result<Option<OffsetDateTime>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let customer = customer_wa.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT m.created_at FROM messages m
                 JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.tenant_id = ?1 AND c.customer_wa = ?2 AND m.direction = 'IN'
                 ORDER BY m.created_at DESC, m.id DESC LIMIT 1",
                params![tenant_id, customer],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::internal)
            .map(|raw| raw.as_deref().and_then(parse_ts))
        })
        .await
    }

    /// Strict 24-hour messaging window: open iff an inbound exists with
    /// `created_at > now - 24h`.
    pub async fn window_open(
        &self,
        tenant_id: &str,
        customer_wa: &PhoneNumber,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let latest = self.latest_inbound_at(tenant_id, customer_wa).await?;
        Ok(matches!(latest, Some(at) if at > now - Duration::hours(24)))
    }
}
