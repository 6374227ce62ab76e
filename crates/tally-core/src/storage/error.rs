//! Storage error handling
//!
//! Typed errors for document persistence and the SQLite projection, with
//! descriptive messages and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::document::DocumentError;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read file
    #[error("Failed to read '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write file
    #[error("Failed to write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Document format is invalid (cannot be parsed)
    #[error("Invalid document format in '{path}': {details}")]
    InvalidFormat { path: PathBuf, details: String },

    /// Document was written by a newer schema than this build can migrate
    #[error("Document at '{path}' uses schema version {found}; this build supports up to {supported}")]
    SchemaMismatch {
        path: PathBuf,
        found: u64,
        supported: u64,
    },

    /// Document could not be created or mutated
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Atomic write failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            // StorageFull is not stable on all toolchains; match on the message too
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::WriteError {
                path,
                source: error,
            },
        }
    }

    /// Classify a failure to parse a document file
    pub fn from_document(error: DocumentError, path: PathBuf) -> Self {
        match error {
            DocumentError::UnsupportedSchema { found, supported } => StorageError::SchemaMismatch {
                path,
                found,
                supported,
            },
            other => StorageError::InvalidFormat {
                path,
                details: other.to_string(),
            },
        }
    }

    /// Whether the on-disk store is unusable and can only be rebuilt
    pub fn is_unrecoverable_format(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidFormat { .. } | StorageError::SchemaMismatch { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions. You may need to run with different permissions or change ownership.")
            }
            StorageError::InvalidFormat { .. } | StorageError::SchemaMismatch { .. } => {
                Some("The store will be rebuilt. The previous file is kept next to it with a '.corrupt' suffix.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StorageError::DiskFull { .. }));
    }

    #[test]
    fn test_other_io_is_write_error() {
        let io_err = io::Error::new(io::ErrorKind::Other, "something odd");
        let err = StorageError::from_io(io_err, PathBuf::from("/x"));

        assert!(matches!(err, StorageError::WriteError { .. }));
        assert!(!err.is_unrecoverable_format());
    }

    #[test]
    fn test_document_schema_becomes_schema_mismatch() {
        let err = StorageError::from_document(
            DocumentError::UnsupportedSchema {
                found: 9,
                supported: 2,
            },
            PathBuf::from("/data/store.automerge"),
        );

        assert!(matches!(
            err,
            StorageError::SchemaMismatch {
                found: 9,
                supported: 2,
                ..
            }
        ));
        assert!(err.is_unrecoverable_format());
    }

    #[test]
    fn test_document_parse_failure_is_invalid_format() {
        let err = StorageError::from_document(
            DocumentError::MissingField("records".to_string()),
            PathBuf::from("/data/store.automerge"),
        );

        assert!(matches!(err, StorageError::InvalidFormat { .. }));
        assert!(err.to_string().contains("records"));
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::PermissionDenied {
            path: PathBuf::from("/test/file"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };

        let msg = err.to_string();
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("/test/file"));
    }
}
