//! 24-hour session tracking and monthly conversation quotas.

use rusqlite::{params, Connection, OptionalExtension};
use time::{Duration, OffsetDateTime};
use wg_core::phone::PhoneNumber;
use wg_core::types::new_id;

use crate::{fmt_ts, is_unique_violation, parse_ts, Store, StoreError};

const SESSION_HOURS: i64 = 24;

/// Outcome of session detection for one inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTouch {
    pub session_id: String,
    pub is_new: bool,
    pub message_count: u64,
}

/// Monthly quota position after (possibly) counting a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub conversation_count: u64,
    pub limit: u32,
}

impl QuotaStatus {
    pub fn exceeded(&self) -> bool {
        self.limit > 0 && self.conversation_count > u64::from(self.limit)
    }
}

struct LatestSession {
    id: String,
    expires_at: Option<OffsetDateTime>,
    message_count: u64,
}

fn latest_session(
    conn: &Connection,
    tenant_id: &str,
    customer: &str,
) -> Result<Option<LatestSession>, StoreError> {
    conn.query_row(
        "SELECT id, expires_at, message_count FROM sessions
         WHERE tenant_id = ?1 AND customer_wa = ?2
         ORDER BY started_at DESC LIMIT 1",
        params![tenant_id, customer],
        |row| {
            let expires: String = row.get(1)?;
            Ok(LatestSession {
                id: row.get(0)?,
                expires_at: parse_ts(&expires),
                message_count: row.get::<_, i64>(2)? as u64,
            })
        },
    )
    .optional()
    .map_err(StoreError::internal)
}

fn extend_session(
    conn: &Connection,
    session: &LatestSession,
    now: OffsetDateTime,
) -> Result<SessionTouch, StoreError> {
    let new_expiry = fmt_ts(now + Duration::hours(SESSION_HOURS));
    conn.execute(
        "UPDATE sessions SET expires_at = ?2, message_count = message_count + 1 WHERE id = ?1",
        params![session.id, new_expiry],
    )
    .map_err(StoreError::internal)?;
    Ok(SessionTouch {
        session_id: session.id.clone(),
        is_new: false,
        message_count: session.message_count + 1,
    })
}

impl Store {
    /// Finds or opens the active 24h session for (tenant, customer).
    ///
    /// Expiry is strict: a session whose `expires_at` equals `now` is
    /// already over. Racing first-contact inserts hit the unique constraint
    /// and fall back to the row the winner created.
    pub async fn detect_session(
        &self,
        tenant_id: &str,
        customer_wa: &PhoneNumber,
        now: OffsetDateTime,
    ) -> Result<SessionTouch, StoreError> {
        let tenant_id = tenant_id.to_string();
        let customer = customer_wa.as_str().to_string();
        self.with_conn(move |conn| {
            if let Some(session) = latest_session(conn, &tenant_id, &customer)? {
                if matches!(session.expires_at, Some(exp) if exp > now) {
                    return extend_session(conn, &session, now);
                }
            }

            let id = new_id();
            let inserted = conn.execute(
                "INSERT INTO sessions (id, tenant_id, customer_wa, started_at, expires_at, message_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![
                    id,
                    tenant_id,
                    customer,
                    fmt_ts(now),
                    fmt_ts(now + Duration::hours(SESSION_HOURS)),
                ],
            );
            match inserted {
                Ok(_) => Ok(SessionTouch {
                    session_id: id,
                    is_new: true,
                    message_count: 1,
                }),
                Err(err) if is_unique_violation(&err) => {
                    // Another request won the race; re-read and count ours.
                    let session = latest_session(conn, &tenant_id, &customer)?
                        .ok_or_else(|| StoreError::NotFound("racing session".into()))?;
                    extend_session(conn, &session, now)
                }
                Err(err) => Err(StoreError::internal(err)),
            }
        })
        .await
    }

    /// Counts a freshly opened session against the month and returns the
    /// post-increment quota position.
    pub async fn record_new_session(
        &self,
        tenant_id: &str,
        limit: u32,
        now: OffsetDateTime,
    ) -> Result<QuotaStatus, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let year = now.year();
            let month = now.month() as u8;
            let day = now.day().to_string();
            let tx = conn.transaction().map_err(StoreError::internal)?;

            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT conversation_count, daily FROM monthly_usage
                     WHERE tenant_id = ?1 AND year = ?2 AND month = ?3",
                    params![tenant_id, year, month],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(StoreError::internal)?;

            let (count, daily_raw) = existing.unwrap_or((0, "{}".into()));
            let mut daily: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&daily_raw).unwrap_or_default();
            let slot = daily.entry(day).or_insert(serde_json::json!(0));
            *slot = serde_json::json!(slot.as_u64().unwrap_or(0) + 1);
            let next = count + 1;

            tx.execute(
                "INSERT INTO monthly_usage (tenant_id, year, month, conversation_count, daily)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (tenant_id, year, month) DO UPDATE SET
                     conversation_count = excluded.conversation_count,
                     daily = excluded.daily",
                params![
                    tenant_id,
                    year,
                    month,
                    next,
                    serde_json::to_string(&daily).unwrap_or_else(|_| "{}".into()),
                ],
            )
            .map_err(StoreError::internal)?;
            tx.commit().map_err(StoreError::internal)?;

            Ok(QuotaStatus {
                conversation_count: next as u64,
                limit,
            })
        })
        .await
    }

    /// Current month usage without incrementing; the send API consults this.
    pub async fn monthly_usage(
        &self,
        tenant_id: &str,
        limit: u32,
        now: OffsetDateTime,
    ) -> Result<QuotaStatus, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT conversation_count FROM monthly_usage
                     WHERE tenant_id = ?1 AND year = ?2 AND month = ?3",
                    params![tenant_id, now.year(), now.month() as u8],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::internal)?;
            Ok(QuotaStatus {
                conversation_count: count.unwrap_or(0) as u64,
                limit,
            })
        })
        .await
    }
}
