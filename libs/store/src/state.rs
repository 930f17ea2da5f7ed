//! Per-conversation flow snapshots and global settings.
//!
//! The flow engine owns the shape of the snapshot; the store treats it as an
//! opaque JSON document keyed by conversation.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{fmt_ts, Store, StoreError};

const BOT_ENABLED_KEY: &str = "bot_enabled";

impl Store {
    pub async fn load_flow(&self, conversation_id: &str) -> Result<Option<Value>, StoreError> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT data FROM flow_state WHERE conversation_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::internal)?;
            Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
        })
        .await
    }

    pub async fn save_flow(
        &self,
        conversation_id: &str,
        data: &Value,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let id = conversation_id.to_string();
        let raw = serde_json::to_string(data).map_err(|e| StoreError::Internal(e.into()))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO flow_state (conversation_id, data, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (conversation_id) DO UPDATE SET
                     data = excluded.data, updated_at = excluded.updated_at",
                params![id, raw, fmt_ts(now)],
            )
            .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
    }

    pub async fn clear_flow(&self, conversation_id: &str) -> Result<(), StoreError> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM flow_state WHERE conversation_id = ?1", params![id])
                .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
    }

    /// Global automation flag; defaults to enabled when unset.
    pub async fn bot_enabled(&self) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![BOT_ENABLED_KEY],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::internal)?;
            Ok(raw.map(|v| v == "true").unwrap_or(true))
        })
        .await
    }

    pub async fn set_bot_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![BOT_ENABLED_KEY, if enabled { "true" } else { "false" }],
            )
            .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
    }
}
