//! Failure kinds
//!
//! Raw storage and cloud errors are turned into a closed [`ErrorKind`] here
//! and nowhere else. Anything that needs to look at backend message text
//! does it in this module, so recovery logic only ever matches on variants.

use std::fmt;

use serde::Serialize;

use crate::cloud::CloudError;
use crate::storage::StorageError;

/// Classified failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorKind {
    /// The on-disk store cannot be read by this build
    SchemaMigrationFailure,
    /// The cloud service rejected the store configuration
    CloudIntegrationUnavailable(String),
    /// No usable cloud account
    CloudAccountUnavailable,
    /// The cloud service could not be reached
    NetworkFailure,
    /// Out of local disk or cloud quota
    QuotaExceeded,
    /// Anything else
    Unknown(String),
}

/// Backend message fragments meaning the configuration itself was refused
const INTEGRATION_MARKERS: &[&str] = &[
    "requires schema",
    "incompatible",
    "different store",
    "not supported",
];
const ACCOUNT_MARKERS: &[&str] = &["account", "unauthorized", "not signed in"];
const QUOTA_MARKERS: &[&str] = &["quota", "limit exceeded"];

impl ErrorKind {
    /// Classify a local storage error
    pub fn from_storage(error: &StorageError) -> Self {
        match error {
            e if e.is_unrecoverable_format() => ErrorKind::SchemaMigrationFailure,
            StorageError::Document(crate::document::DocumentError::UnsupportedSchema {
                ..
            }) => ErrorKind::SchemaMigrationFailure,
            StorageError::DiskFull { .. } => ErrorKind::QuotaExceeded,
            other => ErrorKind::Unknown(other.to_string()),
        }
    }

    /// Classify a cloud backend error
    pub fn from_cloud(error: &CloudError) -> Self {
        match error {
            CloudError::Connection(_) | CloudError::Timeout(_) | CloudError::Io(_) => {
                ErrorKind::NetworkFailure
            }
            CloudError::Rejected(message) => {
                let lower = message.to_lowercase();
                let mentions = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

                if mentions(INTEGRATION_MARKERS) {
                    ErrorKind::CloudIntegrationUnavailable(message.clone())
                } else if mentions(ACCOUNT_MARKERS) {
                    ErrorKind::CloudAccountUnavailable
                } else if mentions(QUOTA_MARKERS) {
                    ErrorKind::QuotaExceeded
                } else {
                    ErrorKind::Unknown(message.clone())
                }
            }
            CloudError::Protocol(message) | CloudError::Document(message) => {
                ErrorKind::Unknown(message.clone())
            }
        }
    }

    /// Short message suitable for a status line
    pub fn user_message(&self) -> String {
        match self {
            ErrorKind::SchemaMigrationFailure => {
                "The local store could not be read and was rebuilt.".to_string()
            }
            ErrorKind::CloudIntegrationUnavailable(reason) => {
                format!("Cloud sync is unavailable for this store: {}", reason)
            }
            ErrorKind::CloudAccountUnavailable => {
                "Sign in to a cloud account to sync this store.".to_string()
            }
            ErrorKind::NetworkFailure => {
                "The sync service could not be reached. Changes are kept locally.".to_string()
            }
            ErrorKind::QuotaExceeded => "Storage quota exceeded.".to_string(),
            ErrorKind::Unknown(message) => format!("Sync error: {}", message),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SchemaMigrationFailure => write!(f, "schema migration failure"),
            ErrorKind::CloudIntegrationUnavailable(reason) => {
                write!(f, "cloud integration unavailable ({})", reason)
            }
            ErrorKind::CloudAccountUnavailable => write!(f, "cloud account unavailable"),
            ErrorKind::NetworkFailure => write!(f, "network failure"),
            ErrorKind::QuotaExceeded => write!(f, "quota exceeded"),
            ErrorKind::Unknown(message) => write!(f, "unknown error ({})", message),
        }
    }
}
