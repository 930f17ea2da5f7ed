//! Table definitions. RFC3339 UTC strings sort lexicographically, so
//! timestamp comparisons happen directly in SQL.

pub const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    wa_number TEXT NOT NULL UNIQUE,
    account_sid TEXT NOT NULL,
    auth_token TEXT NOT NULL,
    require_signature INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'PENDING',
    per_minute INTEGER NOT NULL DEFAULT 60,
    per_day INTEGER NOT NULL DEFAULT 1000,
    monthly_limit INTEGER NOT NULL DEFAULT 1000,
    merchant_id TEXT,
    currency TEXT NOT NULL DEFAULT 'SAR',
    welcome_template_sid TEXT,
    welcome_template_name TEXT,
    order_template_sid TEXT,
    order_template_name TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    customer_wa TEXT NOT NULL,
    is_bot_active INTEGER NOT NULL DEFAULT 1,
    unread_count INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
    last_message_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (tenant_id, customer_wa)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    direction TEXT NOT NULL,
    provider_sid TEXT UNIQUE,
    channel TEXT NOT NULL DEFAULT 'freeform',
    kind TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    media_url TEXT,
    template_sid TEXT,
    template_name TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages (conversation_id, created_at, id);
CREATE INDEX IF NOT EXISTS idx_messages_inbound_window
    ON messages (tenant_id, direction, created_at);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    external_no TEXT,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    order_type TEXT NOT NULL,
    items TEXT NOT NULL DEFAULT '[]',
    subtotal_minor INTEGER NOT NULL DEFAULT 0,
    total_minor INTEGER NOT NULL DEFAULT 0,
    currency TEXT NOT NULL,
    address TEXT,
    branch TEXT,
    payment_method TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS webhook_logs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    digest TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    severity TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS template_cache (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    customer_wa TEXT NOT NULL,
    template_sid TEXT NOT NULL,
    payload TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_template_cache_lookup
    ON template_cache (tenant_id, customer_wa, delivered, created_at);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    customer_wa TEXT NOT NULL,
    started_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 1,
    UNIQUE (tenant_id, customer_wa, started_at)
);
CREATE INDEX IF NOT EXISTS idx_sessions_latest
    ON sessions (tenant_id, customer_wa, started_at DESC);

CREATE TABLE IF NOT EXISTS monthly_usage (
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    conversation_count INTEGER NOT NULL DEFAULT 0,
    daily TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (tenant_id, year, month)
);

CREATE TABLE IF NOT EXISTS flow_state (
    conversation_id TEXT PRIMARY KEY REFERENCES conversations(id),
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
