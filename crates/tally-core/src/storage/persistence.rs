//! Automerge document persistence
//!
//! Handles saving and loading the store document to/from the filesystem.
//! Uses atomic writes (write to temp file, then rename) to prevent corruption.
//!
//! Files, both derived from the store descriptor:
//! - `<name>.automerge` - The Automerge binary document
//! - `<name>.db` - The SQLite projection (rebuildable, never the source of truth)

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{StorageError, StorageResult};
use crate::document::StoreDocument;
use crate::store_id::StoreId;

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub document_exists: bool,
    pub database_exists: bool,
    pub document_size: u64,
    pub database_size: u64,
    /// Durable writes performed by this process
    pub durable_writes: u64,
}

impl StorageStats {
    /// Combined size of document and database
    pub fn total_size(&self) -> u64 {
        self.document_size + self.database_size
    }

    /// Total size formatted for display
    pub fn total_size_human(&self) -> String {
        let size = self.total_size();
        if size < 1024 {
            format!("{} B", size)
        } else if size < 1024 * 1024 {
            format!("{:.1} KB", size as f64 / 1024.0)
        } else {
            format!("{:.1} MB", size as f64 / (1024.0 * 1024.0))
        }
    }
}

/// Persistence layer for a single store document
pub struct DocumentPersistence {
    path: PathBuf,
    projection_path: PathBuf,
    durable_writes: AtomicU64,
}

impl DocumentPersistence {
    /// Create a persistence handler for the given document and projection paths
    pub fn new(path: impl Into<PathBuf>, projection_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            projection_path: projection_path.into(),
            durable_writes: AtomicU64::new(0),
        }
    }

    /// Path of the Automerge document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the SQLite projection
    pub fn projection_path(&self) -> &Path {
        &self.projection_path
    }

    /// Check if a document exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Save a document to disk using atomic write
    pub fn save(&self, doc: &mut StoreDocument) -> StorageResult<()> {
        let bytes = doc.save();
        atomic_write(&self.path, &bytes)?;
        let writes = self.durable_writes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(path = %self.path.display(), bytes = bytes.len(), writes, "Saved store document");
        Ok(())
    }

    /// Load a document from disk
    ///
    /// Returns `None` if the document file doesn't exist. A file that exists
    /// but cannot be parsed, or was written by a newer schema, is an error.
    pub fn load(&self) -> StorageResult<Option<StoreDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path: self.path.clone(),
                source: e,
            },
            _ => StorageError::ReadError {
                path: self.path.clone(),
                source: e,
            },
        })?;

        let doc = StoreDocument::load(&bytes)
            .map_err(|e| StorageError::from_document(e, self.path.clone()))?;

        if let Some(from) = doc.migrated_from() {
            info!(
                path = %self.path.display(),
                from,
                "Migrated store document to current schema"
            );
        }

        Ok(Some(doc))
    }

    /// Load an existing document or create a new one
    ///
    /// A new document is seeded from `seed` when given (so every device
    /// creating the same cloud container starts from the same change) and
    /// written to disk before returning. A migrated document is written back
    /// so the migration only runs once.
    pub fn load_or_create(&self, seed: Option<StoreId>) -> StorageResult<StoreDocument> {
        if let Some(mut doc) = self.load()? {
            if doc.migrated_from().is_some() {
                self.save(&mut doc)?;
            }
            return Ok(doc);
        }

        let mut doc = match seed {
            Some(id) => StoreDocument::with_id(id)?,
            None => StoreDocument::new()?,
        };
        info!(path = %self.path.display(), store_id = %doc.id(), "Creating new store document");
        self.save(&mut doc)?;
        Ok(doc)
    }

    /// Move the records of `doc` into a new document seeded from `id`
    ///
    /// Used when a store created without a cloud container is later given
    /// one, so its replica shares the container's lineage. The old file is
    /// replaced atomically.
    pub fn adopt(&self, doc: &StoreDocument, id: StoreId) -> StorageResult<StoreDocument> {
        let records = doc.get_all_records()?;
        let mut adopted = StoreDocument::with_id(id)?;
        for record in &records {
            adopted.add_record(record)?;
        }
        self.save(&mut adopted)?;

        info!(
            path = %self.path.display(),
            from = %doc.id(),
            to = %id,
            records = records.len(),
            "Adopted cloud container lineage"
        );
        Ok(adopted)
    }

    /// Discard the on-disk store and create an empty one
    ///
    /// The broken document is moved aside to `<file>.corrupt.<millis>` rather
    /// than deleted; if the rename fails it is removed instead. The projection
    /// is always deleted since it is rebuilt from the document.
    pub fn recreate(&self, seed: Option<StoreId>) -> StorageResult<StoreDocument> {
        if self.path.exists() {
            let backup = corrupt_backup_path(&self.path);
            match fs::rename(&self.path, &backup) {
                Ok(()) => warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    "Moved unusable store document aside"
                ),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Failed to move store document aside, deleting it"
                    );
                    fs::remove_file(&self.path)
                        .map_err(|e| StorageError::from_io(e, self.path.clone()))?;
                }
            }
        }

        self.remove_projection()?;

        let mut doc = match seed {
            Some(id) => StoreDocument::with_id(id)?,
            None => StoreDocument::new()?,
        };
        self.save(&mut doc)?;
        Ok(doc)
    }

    /// Delete the projection database and its WAL/SHM side files
    pub fn remove_projection(&self) -> StorageResult<()> {
        for path in projection_files(&self.projection_path) {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StorageError::from_io(e, path.clone()))?;
            }
        }
        Ok(())
    }

    /// Number of durable writes performed through this handler
    pub fn durable_writes(&self) -> u64 {
        self.durable_writes.load(Ordering::SeqCst)
    }

    /// Current storage statistics
    pub fn stats(&self) -> StorageStats {
        let document_size = fs::metadata(&self.path).map(|m| m.len()).ok();
        let database_size = fs::metadata(&self.projection_path).map(|m| m.len()).ok();

        StorageStats {
            document_exists: document_size.is_some(),
            database_exists: database_size.is_some(),
            document_size: document_size.unwrap_or(0),
            database_size: database_size.unwrap_or(0),
            durable_writes: self.durable_writes(),
        }
    }
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt.{}", Utc::now().timestamp_millis()));
    path.with_file_name(name)
}

fn projection_files(path: &Path) -> [PathBuf; 3] {
    let with_suffix = |suffix: &str| {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    };
    [path.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")]
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
///
/// This ensures the target file is never left in a partially-written state.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    // Same directory so the rename stays on one filesystem
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|e| StorageError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::{future_schema_bytes, legacy_v1_bytes};
    use crate::models::Record;
    use tempfile::TempDir;

    fn persistence(temp_dir: &TempDir) -> DocumentPersistence {
        DocumentPersistence::new(
            temp_dir.path().join("default.automerge"),
            temp_dir.path().join("default.db"),
        )
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);

        assert!(!persistence.exists());
        assert!(persistence.load().unwrap().is_none());

        let mut doc = StoreDocument::new().unwrap();
        doc.add_record(&Record::new("project").with_field("name", "Porch"))
            .unwrap();
        persistence.save(&mut doc).unwrap();
        assert!(persistence.exists());

        let loaded = persistence.load().unwrap().unwrap();
        let records = loaded.get_all_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_str("name"), Some("Porch"));
    }

    #[test]
    fn test_load_or_create_uses_seed() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);
        let seed = StoreId::new();

        let doc = persistence.load_or_create(Some(seed)).unwrap();
        assert_eq!(*doc.id(), seed);
        assert!(persistence.exists());
        assert_eq!(persistence.durable_writes(), 1);
    }

    #[test]
    fn test_load_or_create_existing() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);

        let mut doc = StoreDocument::new().unwrap();
        let original_id = *doc.id();
        doc.add_record(&Record::new("invoice")).unwrap();
        persistence.save(&mut doc).unwrap();

        // Existing document wins over the seed
        let loaded = persistence.load_or_create(Some(StoreId::new())).unwrap();
        assert_eq!(*loaded.id(), original_id);
        assert_eq!(loaded.record_count().unwrap(), 1);
        assert_eq!(persistence.durable_writes(), 1);
    }

    #[test]
    fn test_adopt_keeps_records_under_new_id() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);
        let container = StoreId::new();

        let mut doc = persistence.load_or_create(None).unwrap();
        let record = Record::new("invoice").with_field("total", 120);
        doc.add_record(&record).unwrap();
        persistence.save(&mut doc).unwrap();

        let adopted = persistence.adopt(&doc, container).unwrap();
        assert_eq!(*adopted.id(), container);
        assert_eq!(adopted.get_record(record.id).unwrap(), Some(record));

        let reloaded = persistence.load().unwrap().unwrap();
        assert_eq!(*reloaded.id(), container);
        assert_eq!(reloaded.record_count().unwrap(), 1);
    }

    #[test]
    fn test_load_or_create_writes_back_migration() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);
        let id = StoreId::new();
        fs::write(persistence.path(), legacy_v1_bytes(id, &[Record::new("project")])).unwrap();

        let doc = persistence.load_or_create(None).unwrap();
        assert_eq!(doc.migrated_from(), Some(1));
        assert_eq!(persistence.durable_writes(), 1);

        // Second load sees the current schema
        let reloaded = persistence.load().unwrap().unwrap();
        assert!(reloaded.migrated_from().is_none());
    }

    #[test]
    fn test_load_garbage_is_invalid_format() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);
        fs::write(persistence.path(), b"not a document").unwrap();

        let err = persistence.load().err().unwrap();
        assert!(matches!(err, StorageError::InvalidFormat { .. }));
    }

    #[test]
    fn test_load_newer_schema_is_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);
        fs::write(persistence.path(), future_schema_bytes()).unwrap();

        let err = persistence.load().err().unwrap();
        assert!(matches!(err, StorageError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_recreate_moves_broken_file_aside() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);
        fs::write(persistence.path(), b"broken").unwrap();
        fs::write(persistence.projection_path(), b"stale").unwrap();

        let doc = persistence.recreate(None).unwrap();
        assert_eq!(doc.record_count().unwrap(), 0);
        assert!(persistence.exists());
        assert!(!persistence.projection_path().exists());

        let backups: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(backups[0].path()).unwrap(), b"broken");
    }

    #[test]
    fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = persistence(&temp_dir);

        let empty = persistence.stats();
        assert!(!empty.document_exists);
        assert_eq!(empty.total_size(), 0);

        let mut doc = StoreDocument::new().unwrap();
        persistence.save(&mut doc).unwrap();
        persistence.save(&mut doc).unwrap();

        let stats = persistence.stats();
        assert!(stats.document_exists);
        assert!(!stats.database_exists);
        assert!(stats.document_size > 0);
        assert_eq!(stats.durable_writes, 2);
        assert!(stats.total_size_human().ends_with('B'));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("a").join("b").join("file.bin");

        atomic_write(&nested_path, b"test data").unwrap();

        assert_eq!(fs::read_to_string(&nested_path).unwrap(), "test data");
        assert!(!nested_path.with_extension("tmp").exists());
    }
}
