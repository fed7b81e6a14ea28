//! Database schema initialization

use sqlx::SqlitePool;

use super::timestamp;
use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO sync_clock (id, last_stamp) VALUES (1, ?)")
        .bind(timestamp::format(&timestamp::now()))
        .execute(pool)
        .await?;

    Ok(())
}

// Timestamps are RFC 3339 UTC text with microsecond precision, so text order
// is time order. Entity columns must match `entities::schema`.
const SCHEMA_SQL: &str = r#"
-- Last change stamp issued; a single row
CREATE TABLE IF NOT EXISTS sync_clock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_stamp TEXT NOT NULL
);

-- Tenants
CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workspace_members (
    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    -- 'owner', 'admin', 'member' or 'viewer'
    role TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (workspace_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_members_user_id ON workspace_members(user_id);

-- Categories (self-referencing tree)
CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    parent_category_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_categories_delta ON categories(workspace_id, updated_at);

-- Items
CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    sku TEXT,
    description TEXT,
    barcode TEXT,
    category_id TEXT,
    min_stock_level INTEGER,
    is_archived INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_delta ON items(workspace_id, updated_at);

-- Locations (self-referencing tree)
CREATE TABLE IF NOT EXISTS locations (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    parent_location_id TEXT,
    zone TEXT,
    shelf TEXT,
    bin TEXT,
    short_code TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_locations_delta ON locations(workspace_id, updated_at);

-- Containers
CREATE TABLE IF NOT EXISTS containers (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    location_id TEXT NOT NULL,
    capacity TEXT,
    short_code TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_containers_delta ON containers(workspace_id, updated_at);

-- Inventory (item quantities at a location)
CREATE TABLE IF NOT EXISTS inventory (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    location_id TEXT NOT NULL,
    container_id TEXT,
    quantity INTEGER NOT NULL,
    condition TEXT,
    status TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_inventory_delta ON inventory(workspace_id, updated_at);

-- Borrowers
CREATE TABLE IF NOT EXISTS borrowers (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_borrowers_delta ON borrowers(workspace_id, updated_at);

-- Loans
CREATE TABLE IF NOT EXISTS loans (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    inventory_id TEXT NOT NULL,
    borrower_id TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    loaned_at TEXT,
    due_date TEXT,
    returned_at TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_loans_delta ON loans(workspace_id, updated_at);

-- Deletion ledger for offline clients
CREATE TABLE IF NOT EXISTS deleted_records (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    deleted_at TEXT NOT NULL,
    deleted_by TEXT,

    UNIQUE(workspace_id, entity_type, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_deleted_delta ON deleted_records(workspace_id, deleted_at);
"#;
