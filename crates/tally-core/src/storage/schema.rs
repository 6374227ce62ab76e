//! SQLite schema for the read-optimized projection layer
//!
//! The Automerge document remains the source of truth; this database is
//! rebuilt from it and can be deleted at any time.

use rusqlite::{Connection, Result};

/// Current projection schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One row per record; fields are kept as a JSON object
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            data TEXT NOT NULL,
            search_text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);
        CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at);
        CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(updated_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS records_fts USING fts5(
            kind,
            search_text,
            content='records',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS records_ai AFTER INSERT ON records BEGIN
            INSERT INTO records_fts(rowid, kind, search_text)
            VALUES (NEW.rowid, NEW.kind, NEW.search_text);
        END;

        CREATE TRIGGER IF NOT EXISTS records_ad AFTER DELETE ON records BEGIN
            INSERT INTO records_fts(records_fts, rowid, kind, search_text)
            VALUES ('delete', OLD.rowid, OLD.kind, OLD.search_text);
        END;

        CREATE TRIGGER IF NOT EXISTS records_au AFTER UPDATE ON records BEGIN
            INSERT INTO records_fts(records_fts, rowid, kind, search_text)
            VALUES ('delete', OLD.rowid, OLD.kind, OLD.search_text);
            INSERT INTO records_fts(rowid, kind, search_text)
            VALUES (NEW.rowid, NEW.kind, NEW.search_text);
        END;
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Drop every projection table so the schema can be rebuilt from scratch
pub fn drop_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TRIGGER IF EXISTS records_ai;
        DROP TRIGGER IF EXISTS records_ad;
        DROP TRIGGER IF EXISTS records_au;
        DROP TABLE IF EXISTS records_fts;
        DROP TABLE IF EXISTS records;
        DROP TABLE IF EXISTS schema_info;
        "#,
    )
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or rebuild
///
/// Any version other than the current one means a rebuild; the data is
/// derived, so nothing is migrated in place.
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    !matches!(get_schema_version(conn), Ok(Some(v)) if v == SCHEMA_VERSION)
}
