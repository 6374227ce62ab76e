//! Automerge document handling
//!
//! `StoreDocument` is the source of truth for a store. It maps `Record`s
//! into an Automerge document so replicas on several devices can be merged.
//!
//! Layout:
//!
//! ```text
//! ROOT
//! ├── schema_version: u64
//! ├── store_id: String (bs58check)
//! └── records: Map
//!     └── <uuid>: Map { id, kind, created_at, updated_at, fields: Map<key, json> }
//! ```
//!
//! Field values are stored per key as JSON text, so concurrent edits to
//! different fields of one record merge cleanly.

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Map;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Record;
use crate::store_id::StoreId;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field type for {0}")]
    InvalidType(String),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Invalid store ID: {0}")]
    InvalidStoreId(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Invalid field value: {0}")]
    InvalidValue(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Document schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u64, supported: u64 },
}

/// Keys used in the Automerge document structure
mod keys {
    pub const RECORDS: &str = "records";
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const STORE_ID: &str = "store_id";

    pub const ID: &str = "id";
    pub const KIND: &str = "kind";
    pub const FIELDS: &str = "fields";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";

    /// Schema v1 kept all fields in one JSON string
    pub const LEGACY_DATA: &str = "data";
}

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: u64 = 2;

/// A store document backed by Automerge
pub struct StoreDocument {
    id: StoreId,
    doc: AutoCommit,
    migrated_from: Option<u64>,
}

impl StoreDocument {
    /// Create a new empty document with a random ID
    pub fn new() -> Result<Self, DocumentError> {
        Self::with_id(StoreId::new())
    }

    /// Create a new empty document with a specific ID
    ///
    /// The initial change is written by an actor derived from the ID with a
    /// zero timestamp, so two devices that create the same store produce the
    /// same first change and their replicas merge instead of conflicting.
    pub fn with_id(id: StoreId) -> Result<Self, DocumentError> {
        let seed_actor = ActorId::from(id.as_bytes().as_slice());
        let mut doc = AutoCommit::new().with_actor(seed_actor);

        doc.put(ROOT, keys::SCHEMA_VERSION, CURRENT_SCHEMA_VERSION)?;
        doc.put(ROOT, keys::STORE_ID, id.to_bs58check())?;
        doc.put_object(ROOT, keys::RECORDS, ObjType::Map)?;
        doc.commit_with(CommitOptions::default().with_time(0));

        doc.set_actor(ActorId::random());

        Ok(Self {
            id,
            doc,
            migrated_from: None,
        })
    }

    /// Load a document from Automerge bytes
    ///
    /// Older schemas are migrated in memory; the caller decides when to
    /// persist the result. Newer schemas are rejected.
    pub fn load(bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc = AutoCommit::load(bytes)?;

        let version = match doc.get(ROOT, keys::SCHEMA_VERSION)? {
            Some((value, _)) => scalar_u64(&value)
                .ok_or_else(|| DocumentError::InvalidType(keys::SCHEMA_VERSION.to_string()))?,
            None => return Err(DocumentError::MissingField(keys::SCHEMA_VERSION.to_string())),
        };

        if version > CURRENT_SCHEMA_VERSION {
            return Err(DocumentError::UnsupportedSchema {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        let id_str = match doc.get(ROOT, keys::STORE_ID)? {
            Some((value, _)) => value
                .to_str()
                .map(|s| s.to_string())
                .ok_or_else(|| DocumentError::InvalidType(keys::STORE_ID.to_string()))?,
            None => return Err(DocumentError::MissingField(keys::STORE_ID.to_string())),
        };
        let id = StoreId::from_bs58check(&id_str)
            .map_err(|e| DocumentError::InvalidStoreId(e.to_string()))?;

        let mut loaded = Self {
            id,
            doc,
            migrated_from: None,
        };

        if version < CURRENT_SCHEMA_VERSION {
            loaded.migrate(version)?;
        }

        Ok(loaded)
    }

    /// Get the store ID
    pub fn id(&self) -> &StoreId {
        &self.id
    }

    /// Get the Automerge URL for this document
    pub fn url(&self) -> String {
        self.id.to_url()
    }

    /// Schema version the document was migrated from during load, if any
    pub fn migrated_from(&self) -> Option<u64> {
        self.migrated_from
    }

    /// Current schema version stored in the document
    pub fn schema_version(&self) -> Result<u64, DocumentError> {
        match self.doc.get(ROOT, keys::SCHEMA_VERSION)? {
            Some((value, _)) => scalar_u64(&value)
                .ok_or_else(|| DocumentError::InvalidType(keys::SCHEMA_VERSION.to_string())),
            None => Err(DocumentError::MissingField(keys::SCHEMA_VERSION.to_string())),
        }
    }

    /// Save the document to bytes
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Fork the document
    ///
    /// The fork gets its own actor; merge it back with [`merge`](Self::merge).
    pub fn fork(&mut self) -> Self {
        Self {
            id: self.id,
            doc: self.doc.fork(),
            migrated_from: None,
        }
    }

    /// Merge another document into this one
    ///
    /// Returns `true` if this document gained changes.
    pub fn merge(&mut self, other: &mut StoreDocument) -> Result<bool, DocumentError> {
        let before = self.doc.get_heads();
        self.doc.merge(&mut other.doc)?;
        Ok(self.doc.get_heads() != before)
    }

    /// Get the underlying Automerge document mutably (for sync operations)
    pub fn inner_mut(&mut self) -> &mut AutoCommit {
        &mut self.doc
    }

    // ==================== Records ====================

    /// Add a record, replacing any existing record with the same ID
    pub fn add_record(&mut self, record: &Record) -> Result<(), DocumentError> {
        let records_id = self.records_obj()?;
        let record_obj = self
            .doc
            .put_object(&records_id, record.id.to_string(), ObjType::Map)?;
        self.write_record(&record_obj, record)
    }

    /// Update an existing record
    ///
    /// Only changed fields are rewritten; removed fields are deleted.
    pub fn update_record(&mut self, record: &Record) -> Result<(), DocumentError> {
        let records_id = self.records_obj()?;
        let record_obj = self
            .doc
            .get(&records_id, record.id.to_string())?
            .ok_or(DocumentError::RecordNotFound(record.id))?
            .1;
        self.write_record(&record_obj, record)
    }

    /// Delete a record
    pub fn delete_record(&mut self, id: Uuid) -> Result<(), DocumentError> {
        let records_id = self.records_obj()?;
        if self.doc.get(&records_id, id.to_string())?.is_none() {
            return Err(DocumentError::RecordNotFound(id));
        }
        self.doc.delete(&records_id, id.to_string())?;
        Ok(())
    }

    /// Get a record by ID
    pub fn get_record(&self, id: Uuid) -> Result<Option<Record>, DocumentError> {
        let records_id = self.records_obj()?;
        match self.doc.get(&records_id, id.to_string())? {
            Some((_, record_obj)) => Ok(Some(self.read_record(&record_obj, id)?)),
            None => Ok(None),
        }
    }

    /// Get all records
    pub fn get_all_records(&self) -> Result<Vec<Record>, DocumentError> {
        let records_id = self.records_obj()?;

        let mut records = Vec::new();
        for key in self.doc.keys(&records_id) {
            let id = Uuid::parse_str(&key).map_err(|_| DocumentError::InvalidUuid(key.clone()))?;
            if let Some((_, record_obj)) = self.doc.get(&records_id, &key)? {
                records.push(self.read_record(&record_obj, id)?);
            }
        }
        Ok(records)
    }

    /// Number of records
    pub fn record_count(&self) -> Result<usize, DocumentError> {
        let records_id = self.records_obj()?;
        Ok(self.doc.keys(&records_id).count())
    }

    // ==================== Migration ====================

    fn migrate(&mut self, from: u64) -> Result<(), DocumentError> {
        if from < 2 {
            self.migrate_v1_inline_data()?;
        }
        self.doc
            .put(ROOT, keys::SCHEMA_VERSION, CURRENT_SCHEMA_VERSION)?;
        self.migrated_from = Some(from);
        Ok(())
    }

    /// v1 → v2: split the `data` JSON blob into a per-field map
    fn migrate_v1_inline_data(&mut self) -> Result<(), DocumentError> {
        let records_id = self.records_obj()?;
        let record_keys: Vec<String> = self.doc.keys(&records_id).collect();

        for key in record_keys {
            let Some((_, record_obj)) = self.doc.get(&records_id, &key)? else {
                continue;
            };
            let Some(data) = self.get_optional_string(&record_obj, keys::LEGACY_DATA)? else {
                continue;
            };

            let fields: Map<String, serde_json::Value> = serde_json::from_str(&data)?;
            let fields_obj = self
                .doc
                .put_object(&record_obj, keys::FIELDS, ObjType::Map)?;
            for (name, value) in &fields {
                self.doc
                    .put(&fields_obj, name.as_str(), serde_json::to_string(value)?)?;
            }
            self.doc.delete(&record_obj, keys::LEGACY_DATA)?;
        }
        Ok(())
    }

    // ==================== Private helpers ====================

    fn records_obj(&self) -> Result<ObjId, DocumentError> {
        Ok(self
            .doc
            .get(ROOT, keys::RECORDS)?
            .ok_or_else(|| DocumentError::MissingField(keys::RECORDS.to_string()))?
            .1)
    }

    fn write_record(&mut self, obj_id: &ObjId, record: &Record) -> Result<(), DocumentError> {
        self.doc.put(obj_id, keys::ID, record.id.to_string())?;
        self.doc.put(obj_id, keys::KIND, record.kind.clone())?;

        let fields_obj = match self.doc.get(obj_id, keys::FIELDS)? {
            Some((Value::Object(ObjType::Map), existing)) => existing,
            _ => self.doc.put_object(obj_id, keys::FIELDS, ObjType::Map)?,
        };

        let stale: Vec<String> = self
            .doc
            .keys(&fields_obj)
            .filter(|k| !record.fields.contains_key(k))
            .collect();
        for key in stale {
            self.doc.delete(&fields_obj, key)?;
        }

        for (name, value) in &record.fields {
            let encoded = serde_json::to_string(value)?;
            let unchanged = self
                .get_optional_string(&fields_obj, name)?
                .is_some_and(|current| current == encoded);
            if !unchanged {
                self.doc.put(&fields_obj, name.as_str(), encoded)?;
            }
        }

        self.doc.put(
            obj_id,
            keys::CREATED_AT,
            record.created_at.timestamp_millis(),
        )?;
        self.doc.put(
            obj_id,
            keys::UPDATED_AT,
            record.updated_at.timestamp_millis(),
        )?;

        Ok(())
    }

    fn read_record(&self, obj_id: &ObjId, id: Uuid) -> Result<Record, DocumentError> {
        let kind = self.get_string(obj_id, keys::KIND)?;
        let created_at = self.get_timestamp(obj_id, keys::CREATED_AT)?;
        let updated_at = self.get_timestamp(obj_id, keys::UPDATED_AT)?;

        let mut fields = Map::new();
        if let Some((_, fields_obj)) = self.doc.get(obj_id, keys::FIELDS)? {
            for name in self.doc.keys(&fields_obj) {
                let raw = self.get_string(&fields_obj, &name)?;
                fields.insert(name, serde_json::from_str(&raw)?);
            }
        }

        Ok(Record {
            id,
            kind,
            fields,
            created_at,
            updated_at,
        })
    }

    fn get_string(&self, obj_id: &ObjId, key: &str) -> Result<String, DocumentError> {
        match self.doc.get(obj_id, key)? {
            Some((value, _)) => value
                .to_str()
                .map(|s| s.to_string())
                .ok_or_else(|| DocumentError::InvalidType(key.to_string())),
            None => Err(DocumentError::MissingField(key.to_string())),
        }
    }

    fn get_optional_string(
        &self,
        obj_id: &ObjId,
        key: &str,
    ) -> Result<Option<String>, DocumentError> {
        match self.doc.get(obj_id, key)? {
            Some((value, _)) => Ok(value.to_str().map(|s| s.to_string())),
            None => Ok(None),
        }
    }

    fn get_timestamp(&self, obj_id: &ObjId, key: &str) -> Result<DateTime<Utc>, DocumentError> {
        match self.doc.get(obj_id, key)? {
            Some((value, _)) => {
                let millis = value
                    .to_i64()
                    .ok_or_else(|| DocumentError::InvalidType(key.to_string()))?;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or(DocumentError::InvalidTimestamp(millis))
            }
            None => Err(DocumentError::MissingField(key.to_string())),
        }
    }
}

fn scalar_u64(value: &Value<'_>) -> Option<u64> {
    match value {
        Value::Scalar(scalar) => match scalar.as_ref() {
            ScalarValue::Uint(v) => Some(*v),
            ScalarValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Build a schema-v1 document the way older builds wrote it
    pub(crate) fn legacy_v1_bytes(id: StoreId, records: &[Record]) -> Vec<u8> {
        let mut doc = AutoCommit::new();
        doc.put(ROOT, keys::SCHEMA_VERSION, 1u64).unwrap();
        doc.put(ROOT, keys::STORE_ID, id.to_bs58check()).unwrap();
        let records_id = doc.put_object(ROOT, keys::RECORDS, ObjType::Map).unwrap();
        for record in records {
            let obj = doc
                .put_object(&records_id, record.id.to_string(), ObjType::Map)
                .unwrap();
            doc.put(&obj, keys::ID, record.id.to_string()).unwrap();
            doc.put(&obj, keys::KIND, record.kind.clone()).unwrap();
            doc.put(
                &obj,
                keys::LEGACY_DATA,
                serde_json::to_string(&record.fields).unwrap(),
            )
            .unwrap();
            doc.put(&obj, keys::CREATED_AT, record.created_at.timestamp_millis())
                .unwrap();
            doc.put(&obj, keys::UPDATED_AT, record.updated_at.timestamp_millis())
                .unwrap();
        }
        doc.save()
    }

    /// Build a document claiming a schema newer than this build understands
    pub(crate) fn future_schema_bytes() -> Vec<u8> {
        let mut doc = AutoCommit::new();
        doc.put(ROOT, keys::SCHEMA_VERSION, CURRENT_SCHEMA_VERSION + 1)
            .unwrap();
        doc.put(ROOT, keys::STORE_ID, StoreId::new().to_bs58check())
            .unwrap();
        doc.put_object(ROOT, keys::RECORDS, ObjType::Map).unwrap();
        doc.save()
    }

    #[test]
    fn test_new_document() {
        let doc = StoreDocument::new().unwrap();
        assert!(doc.get_all_records().unwrap().is_empty());
        assert_eq!(doc.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_add_and_get_record() {
        let mut doc = StoreDocument::new().unwrap();
        let record = Record::new("project")
            .with_field("name", "Garage")
            .with_field("budget", 1200);

        doc.add_record(&record).unwrap();

        let retrieved = doc.get_record(record.id).unwrap().unwrap();
        assert_eq!(retrieved.kind, "project");
        assert_eq!(retrieved.get_str("name"), Some("Garage"));
        assert_eq!(retrieved.get("budget"), Some(&json!(1200)));
        assert_eq!(
            retrieved.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_update_removes_stale_fields() {
        let mut doc = StoreDocument::new().unwrap();
        let mut record = Record::new("invoice")
            .with_field("number", "INV-7")
            .with_field("draft", true);
        doc.add_record(&record).unwrap();

        record.remove("draft");
        record.set("number", "INV-8");
        doc.update_record(&record).unwrap();

        let retrieved = doc.get_record(record.id).unwrap().unwrap();
        assert_eq!(retrieved.get_str("number"), Some("INV-8"));
        assert!(retrieved.get("draft").is_none());
    }

    #[test]
    fn test_update_missing_record() {
        let mut doc = StoreDocument::new().unwrap();
        let record = Record::new("invoice");
        assert!(matches!(
            doc.update_record(&record),
            Err(DocumentError::RecordNotFound(id)) if id == record.id
        ));
    }

    #[test]
    fn test_delete_record() {
        let mut doc = StoreDocument::new().unwrap();
        let record = Record::new("location");
        doc.add_record(&record).unwrap();

        doc.delete_record(record.id).unwrap();
        assert!(doc.get_record(record.id).unwrap().is_none());
        assert!(doc.delete_record(record.id).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let mut doc = StoreDocument::new().unwrap();
        let original_id = *doc.id();
        doc.add_record(&Record::new("project").with_field("name", "Deck"))
            .unwrap();

        let bytes = doc.save();
        let loaded = StoreDocument::load(&bytes).unwrap();

        assert_eq!(*loaded.id(), original_id);
        assert_eq!(loaded.record_count().unwrap(), 1);
        assert!(loaded.migrated_from().is_none());
    }

    #[test]
    fn test_load_rejects_newer_schema() {
        let bytes = future_schema_bytes();
        assert!(matches!(
            StoreDocument::load(&bytes),
            Err(DocumentError::UnsupportedSchema { found, supported })
                if found == CURRENT_SCHEMA_VERSION + 1 && supported == CURRENT_SCHEMA_VERSION
        ));
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(StoreDocument::load(b"definitely not automerge").is_err());
    }

    #[test]
    fn test_migrates_v1_documents() {
        let id = StoreId::new();
        let record = Record::new("invoice").with_field("number", "INV-1");
        let bytes = legacy_v1_bytes(id, std::slice::from_ref(&record));

        let loaded = StoreDocument::load(&bytes).unwrap();
        assert_eq!(loaded.migrated_from(), Some(1));
        assert_eq!(loaded.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);

        let migrated = loaded.get_record(record.id).unwrap().unwrap();
        assert_eq!(migrated.get_str("number"), Some("INV-1"));
    }

    #[test]
    fn test_merge_forks() {
        let mut doc1 = StoreDocument::new().unwrap();
        let mut doc2 = doc1.fork();

        doc1.add_record(&Record::new("project")).unwrap();
        doc2.add_record(&Record::new("project")).unwrap();

        assert!(doc1.merge(&mut doc2).unwrap());
        assert_eq!(doc1.record_count().unwrap(), 2);

        // Merging again brings nothing new
        assert!(!doc1.merge(&mut doc2).unwrap());
    }

    #[test]
    fn test_independent_replicas_of_same_store_merge() {
        let id = StoreId::new();
        let mut device_a = StoreDocument::with_id(id).unwrap();
        let mut device_b = StoreDocument::with_id(id).unwrap();

        device_a
            .add_record(&Record::new("project").with_field("name", "A"))
            .unwrap();
        device_b
            .add_record(&Record::new("project").with_field("name", "B"))
            .unwrap();

        device_a.merge(&mut device_b).unwrap();
        assert_eq!(device_a.record_count().unwrap(), 2);
    }
}
