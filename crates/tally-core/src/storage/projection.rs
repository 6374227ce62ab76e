//! SQLite projection layer
//!
//! Projects the store document to SQLite for fast read queries.
//! SQLite serves as a read-optimized cache; Automerge remains source of truth.
//!
//! ## Tables
//!
//! - `records` - One row per record, fields as a JSON object in `data`
//! - `records_fts` - Full-text search over string fields (auto-synced via triggers)
//!
//! The store manager refreshes single rows after each mutation and does a
//! full rebuild after opening or merging remote changes.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::{drop_schema, init_schema, needs_init};
use crate::document::StoreDocument;
use crate::models::Record;

/// A predicate query over projected records
///
/// All conditions are combined with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// Only records of this kind
    pub kind: Option<String>,
    /// Field equality conditions, matched through `json_extract`
    pub equals: Vec<(String, Value)>,
    /// Full-text search over string fields
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// SQLite projection layer for read-optimized queries
pub struct SqliteProjection {
    conn: Connection,
}

impl SqliteProjection {
    /// Open or create the SQLite database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        Self::prepare(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> StorageResult<Self> {
        if needs_init(&conn) {
            drop_schema(&conn)?;
            init_schema(&conn)?;
        }
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Project the entire document to SQLite
    ///
    /// Clears all existing rows and repopulates from the document in one
    /// transaction.
    pub fn project_full(&mut self, doc: &StoreDocument) -> StorageResult<()> {
        let records = doc.get_all_records()?;

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM records", [])?;
        for record in &records {
            upsert(&tx, record)?;
        }
        tx.commit()?;

        debug!(records = records.len(), "Rebuilt projection");
        Ok(())
    }

    /// Insert or replace a single record row
    pub fn upsert_record(&mut self, record: &Record) -> StorageResult<()> {
        upsert(&self.conn, record)
    }

    /// Remove a single record row
    pub fn remove_record(&mut self, id: Uuid) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM records WHERE id = ?", params![id.to_string()])?;
        Ok(())
    }

    // ==================== Query Methods ====================

    /// Get a record by ID
    pub fn get(&self, id: Uuid) -> StorageResult<Option<Record>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, data, created_at, updated_at FROM records WHERE id = ?",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;

        match rows.next()? {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// List records, optionally restricted to one kind, newest first
    pub fn list(&self, kind: Option<&str>) -> StorageResult<Vec<Record>> {
        let mut query = RecordQuery::new();
        query.kind = kind.map(str::to_string);
        self.query(&query)
    }

    /// Run a predicate query
    pub fn query(&self, query: &RecordQuery) -> StorageResult<Vec<Record>> {
        let mut sql = String::from(
            "SELECT r.id, r.kind, r.data, r.created_at, r.updated_at FROM records r",
        );
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        let fts = match query.text.as_deref().map(fts_query) {
            Some(None) => return Ok(Vec::new()),
            Some(Some(fts)) => Some(fts),
            None => None,
        };
        if let Some(fts) = fts.as_ref() {
            sql.push_str(" JOIN records_fts fts ON r.rowid = fts.rowid");
            conditions.push("records_fts MATCH ?".to_string());
            args.push(Box::new(fts.clone()));
        }

        if let Some(kind) = &query.kind {
            conditions.push("r.kind = ?".to_string());
            args.push(Box::new(kind.clone()));
        }

        for (field, value) in &query.equals {
            let path = json_path(field);
            match value {
                Value::Null => {
                    conditions.push("json_type(r.data, ?) = 'null'".to_string());
                    args.push(Box::new(path));
                }
                Value::Bool(b) => {
                    conditions.push("json_extract(r.data, ?) = ?".to_string());
                    args.push(Box::new(path));
                    args.push(Box::new(i64::from(*b)));
                }
                Value::Number(n) => {
                    conditions.push("json_extract(r.data, ?) = ?".to_string());
                    args.push(Box::new(path));
                    match n.as_i64() {
                        Some(i) => args.push(Box::new(i)),
                        None => args.push(Box::new(n.as_f64().unwrap_or(f64::NAN))),
                    }
                }
                Value::String(s) => {
                    conditions.push("json_extract(r.data, ?) = ?".to_string());
                    args.push(Box::new(path));
                    args.push(Box::new(s.clone()));
                }
                Value::Array(_) | Value::Object(_) => {
                    conditions.push("json(json_extract(r.data, ?)) = json(?)".to_string());
                    args.push(Box::new(path));
                    args.push(Box::new(value.to_string()));
                }
            }
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        if fts.is_some() {
            sql.push_str(" ORDER BY rank");
        } else {
            sql.push_str(" ORDER BY r.created_at DESC, r.id");
        }

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| record_from_row(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Full-text search over string fields
    pub fn search(&self, text: &str) -> StorageResult<Vec<Record>> {
        self.query(&RecordQuery::new().text(text))
    }

    /// Count records, optionally restricted to one kind
    pub fn count(&self, kind: Option<&str>) -> StorageResult<i64> {
        let count = match kind {
            Some(kind) => self.conn.query_row(
                "SELECT COUNT(*) FROM records WHERE kind = ?",
                params![kind],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?,
        };
        Ok(count)
    }
}

fn upsert(conn: &Connection, record: &Record) -> StorageResult<()> {
    let data = serde_json::to_string(&record.fields)
        .map_err(|e| StorageError::Document(e.into()))?;
    // ON CONFLICT keeps the rowid, so the FTS update trigger fires instead of a bare delete
    conn.execute(
        r#"
        INSERT INTO records (id, kind, data, search_text, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            data = excluded.data,
            search_text = excluded.search_text,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at
        "#,
        params![
            record.id.to_string(),
            record.kind,
            data,
            record.search_text(),
            record.created_at.timestamp_millis(),
            record.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let data: String = row.get(2)?;
    let created_at: i64 = row.get(3)?;
    let updated_at: i64 = row.get(4)?;

    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let fields = serde_json::from_str(&data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(Record {
        id,
        kind,
        fields,
        created_at: timestamp(created_at, 3)?,
        updated_at: timestamp(updated_at, 4)?,
    })
}

fn timestamp(millis: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

/// JSON path for a top-level field, quoted so any key is addressable
fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// Turn free text into an FTS5 query of quoted terms
///
/// Returns `None` when there is nothing to search for.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_doc() -> StoreDocument {
        let mut doc = StoreDocument::new().unwrap();
        doc.add_record(
            &Record::new("project")
                .with_field("name", "Kitchen remodel")
                .with_field("client", "Smith")
                .with_field("active", true),
        )
        .unwrap();
        doc.add_record(
            &Record::new("project")
                .with_field("name", "Garage door")
                .with_field("client", "Jones")
                .with_field("active", false),
        )
        .unwrap();
        doc.add_record(
            &Record::new("invoice")
                .with_field("number", "INV-100")
                .with_field("total", 250),
        )
        .unwrap();
        doc
    }

    fn projected() -> SqliteProjection {
        let mut projection = SqliteProjection::open_in_memory().unwrap();
        projection.project_full(&create_test_doc()).unwrap();
        projection
    }

    #[test]
    fn test_project_full() {
        let projection = projected();
        assert_eq!(projection.count(None).unwrap(), 3);
        assert_eq!(projection.count(Some("project")).unwrap(), 2);
    }

    #[test]
    fn test_project_full_replaces_data() {
        let mut projection = projected();

        let mut other = StoreDocument::new().unwrap();
        other.add_record(&Record::new("location")).unwrap();
        projection.project_full(&other).unwrap();

        assert_eq!(projection.count(None).unwrap(), 1);
        assert!(projection.search("Kitchen").unwrap().is_empty());
    }

    #[test]
    fn test_get_by_id() {
        let mut projection = SqliteProjection::open_in_memory().unwrap();
        let record = Record::new("invoice").with_field("number", "INV-9");
        projection.upsert_record(&record).unwrap();

        let found = projection.get(record.id).unwrap().unwrap();
        assert_eq!(found.get_str("number"), Some("INV-9"));
        assert_eq!(
            found.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );
        assert!(projection.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_updates_search_index() {
        let mut projection = SqliteProjection::open_in_memory().unwrap();
        let mut record = Record::new("project").with_field("name", "Roof");
        projection.upsert_record(&record).unwrap();

        record.set("name", "Basement");
        projection.upsert_record(&record).unwrap();

        assert_eq!(projection.count(None).unwrap(), 1);
        assert!(projection.search("Roof").unwrap().is_empty());
        assert_eq!(projection.search("Basement").unwrap().len(), 1);
    }

    #[test]
    fn test_remove_record() {
        let mut projection = SqliteProjection::open_in_memory().unwrap();
        let record = Record::new("project").with_field("name", "Shed");
        projection.upsert_record(&record).unwrap();

        projection.remove_record(record.id).unwrap();
        assert_eq!(projection.count(None).unwrap(), 0);
        assert!(projection.search("Shed").unwrap().is_empty());
    }

    #[test]
    fn test_list_by_kind() {
        let projection = projected();
        let invoices = projection.list(Some("invoice")).unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].get("total"), Some(&json!(250)));
        assert_eq!(projection.list(None).unwrap().len(), 3);
    }

    #[test]
    fn test_query_field_equality() {
        let projection = projected();

        let smith = projection
            .query(&RecordQuery::new().kind("project").field_eq("client", "Smith"))
            .unwrap();
        assert_eq!(smith.len(), 1);
        assert_eq!(smith[0].get_str("name"), Some("Kitchen remodel"));

        let active = projection
            .query(&RecordQuery::new().field_eq("active", true))
            .unwrap();
        assert_eq!(active.len(), 1);

        let total = projection
            .query(&RecordQuery::new().field_eq("total", 250))
            .unwrap();
        assert_eq!(total.len(), 1);
    }

    #[test]
    fn test_query_limit() {
        let projection = projected();
        let limited = projection.query(&RecordQuery::new().limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_search() {
        let projection = projected();
        let results = projection.search("garage").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get_str("client"), Some("Jones"));
    }

    #[test]
    fn test_search_special_characters() {
        let projection = projected();
        // Operators and quotes are treated as literal terms
        assert!(projection.search("\"AND OR").unwrap().is_empty());
        assert!(projection.search("   ").unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("store.db");

        {
            let mut projection = SqliteProjection::open(&path).unwrap();
            projection.project_full(&create_test_doc()).unwrap();
        }

        let reopened = SqliteProjection::open(&path).unwrap();
        assert_eq!(reopened.count(None).unwrap(), 3);
    }
}
