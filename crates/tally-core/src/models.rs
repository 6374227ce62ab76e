//! Data models for Tally
//!
//! The store does not own any business schema. Collaborators persist
//! `Record`s: a `kind` tag (e.g. "project", "invoice") plus a map of
//! JSON fields whose meaning belongs to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A generic domain record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Unique identifier
    pub id: Uuid,
    /// Record kind, used for filtering
    pub kind: String,
    /// Caller-defined fields
    pub fields: Map<String, Value>,
    /// When this record was created
    pub created_at: DateTime<Utc>,
    /// When this record was last updated
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create a new, empty record of the given kind
    pub fn new(kind: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), kind)
    }

    /// Create a record with a specific ID (for loading from storage)
    pub fn with_id(id: Uuid, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: kind.into(),
            fields: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a field
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
        self.updated_at = Utc::now();
    }

    /// Remove a field, returning its previous value
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.fields.remove(key);
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Get a field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a string field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Concatenated text of all string fields, fed to full-text search
    pub fn search_text(&self) -> String {
        self.fields
            .values()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
