//! Tenant rows and credential management.

use rusqlite::{params, Connection, OptionalExtension, Row};
use wg_core::phone::PhoneNumber;
use wg_core::types::{TemplateDescriptor, Tenant, TenantLimits, TenantStatus};

use crate::{Store, StoreError};

/// Insertable tenant record; admin CRUD beyond this is out of scope.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub tenant: Tenant,
}

impl NewTenant {
    pub fn from_tenant(tenant: &Tenant) -> Self {
        Self {
            tenant: tenant.clone(),
        }
    }
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let wa_number: String = row.get("wa_number")?;
    let status: String = row.get("status")?;
    let welcome_sid: Option<String> = row.get("welcome_template_sid")?;
    let welcome_name: Option<String> = row.get("welcome_template_name")?;
    let order_sid: Option<String> = row.get("order_template_sid")?;
    let order_name: Option<String> = row.get("order_template_name")?;

    Ok(Tenant {
        id: row.get("id")?,
        name: row.get("name")?,
        wa_number: wg_core::phone::normalize(&wa_number).map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "wa_number".into(), rusqlite::types::Type::Text)
        })?,
        account_sid: row.get("account_sid")?,
        auth_token: row.get("auth_token")?,
        require_signature: row.get::<_, i64>("require_signature")? != 0,
        is_active: row.get::<_, i64>("is_active")? != 0,
        status: TenantStatus::parse(&status).unwrap_or(TenantStatus::Pending),
        limits: TenantLimits {
            per_minute: row.get::<_, i64>("per_minute")? as u32,
            per_day: row.get::<_, i64>("per_day")? as u32,
            monthly_conversations: row.get::<_, i64>("monthly_limit")? as u32,
        },
        merchant_id: row.get("merchant_id")?,
        currency: row.get("currency")?,
        welcome_template: zip_template(welcome_sid, welcome_name),
        order_template: zip_template(order_sid, order_name),
    })
}

fn zip_template(sid: Option<String>, name: Option<String>) -> Option<TemplateDescriptor> {
    let sid = sid?;
    Some(TemplateDescriptor {
        friendly_name: name.unwrap_or_else(|| sid.clone()),
        sid,
    })
}

fn select_tenant(
    conn: &Connection,
    where_clause: &str,
    value: &str,
) -> Result<Option<Tenant>, StoreError> {
    let sql = format!("SELECT * FROM tenants WHERE {where_clause} = ?1");
    conn.query_row(&sql, params![value], tenant_from_row)
        .optional()
        .map_err(StoreError::internal)
}

impl Store {
    pub async fn insert_tenant(&self, new: NewTenant) -> Result<(), StoreError> {
        let t = new.tenant;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tenants (id, name, wa_number, account_sid, auth_token,
                     require_signature, is_active, status, per_minute, per_day,
                     monthly_limit, merchant_id, currency,
                     welcome_template_sid, welcome_template_name,
                     order_template_sid, order_template_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    t.id,
                    t.name,
                    t.wa_number.as_str(),
                    t.account_sid,
                    t.auth_token,
                    t.require_signature as i64,
                    t.is_active as i64,
                    t.status.as_str(),
                    i64::from(t.limits.per_minute),
                    i64::from(t.limits.per_day),
                    i64::from(t.limits.monthly_conversations),
                    t.merchant_id,
                    t.currency,
                    t.welcome_template.as_ref().map(|d| d.sid.clone()),
                    t.welcome_template.as_ref().map(|d| d.friendly_name.clone()),
                    t.order_template.as_ref().map(|d| d.sid.clone()),
                    t.order_template.as_ref().map(|d| d.friendly_name.clone()),
                ],
            )
            .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
    }

    /// Raw lookup by canonical destination number; the cached path lives in
    /// [`crate::TenantRegistry`].
    pub async fn tenant_by_destination(
        &self,
        wa_number: &PhoneNumber,
    ) -> Result<Option<Tenant>, StoreError> {
        let number = wa_number.as_str().to_string();
        self.with_conn(move |conn| select_tenant(conn, "wa_number", &number))
            .await
    }

    pub async fn tenant_by_id(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| select_tenant(conn, "id", &id))
            .await
    }

    pub async fn update_tenant_credentials(
        &self,
        id: &str,
        account_sid: &str,
        auth_token: &str,
    ) -> Result<(), StoreError> {
        let (id, sid, token) = (id.to_string(), account_sid.to_string(), auth_token.to_string());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tenants SET account_sid = ?2, auth_token = ?3 WHERE id = ?1",
                    params![id, sid, token],
                )
                .map_err(StoreError::internal)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("tenant {id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn update_tenant_limits(
        &self,
        id: &str,
        limits: wg_core::types::TenantLimits,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tenants SET per_minute = ?2, per_day = ?3, monthly_limit = ?4
                     WHERE id = ?1",
                    params![
                        id,
                        i64::from(limits.per_minute),
                        i64::from(limits.per_day),
                        i64::from(limits.monthly_conversations),
                    ],
                )
                .map_err(StoreError::internal)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("tenant {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Soft activation toggle; deactivation also flips status to INACTIVE.
    pub async fn set_tenant_active(&self, id: &str, active: bool) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let status = if active { "ACTIVE" } else { "INACTIVE" };
            let changed = conn
                .execute(
                    "UPDATE tenants SET is_active = ?2, status = ?3 WHERE id = ?1",
                    params![id, active as i64, status],
                )
                .map_err(StoreError::internal)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("tenant {id}")));
            }
            Ok(())
        })
        .await
    }
}
