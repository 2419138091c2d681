//! SQLite schema for the single item table

use rusqlite::Connection;
use tracing::info;

use crate::error::ProjectionError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), ProjectionError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new item table schema v{}", SCHEMA_VERSION);
        conn.execute_batch(ITEMS_SCHEMA)
            .map_err(|e| ProjectionError::Database(format!("Failed to create items table: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Item table schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, ProjectionError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| ProjectionError::Database(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), ProjectionError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| ProjectionError::Database(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| ProjectionError::Database(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Item table; `body` is the serialized row, the other columns are extracted
/// from it on every write so they never disagree.
const ITEMS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    pk TEXT NOT NULL,
    sk TEXT NOT NULL,
    version INTEGER NOT NULL,
    item_type TEXT NOT NULL,

    -- Time index (projection rows only)
    entity_id TEXT,
    start_ts INTEGER,
    end_ts INTEGER,

    body TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),

    PRIMARY KEY (pk, sk)
);

CREATE INDEX IF NOT EXISTS idx_items_start ON items(pk, start_ts, entity_id)
    WHERE start_ts IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_items_end ON items(pk, end_ts, entity_id)
    WHERE end_ts IS NOT NULL;
"#;
