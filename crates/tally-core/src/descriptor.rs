//! Store descriptor
//!
//! Immutable description of the store a process opens: where it lives and
//! whether it should be mirrored to the cloud. Built once at startup;
//! changing it means restarting.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::config::Config;
use crate::store_id::StoreId;

/// Errors validating a descriptor
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Store path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("Cannot create store directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Store location is not writable: {0}")]
    ReadOnly(PathBuf),

    #[error("Cloud container id '{id}' is invalid: {reason}")]
    InvalidContainer { id: String, reason: String },
}

/// Configuration for a named store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub name: String,
    pub file_path: PathBuf,
    pub cloud_enabled: bool,
    pub cloud_container_id: Option<String>,
}

impl StoreDescriptor {
    /// Local-only descriptor
    pub fn local(name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            cloud_enabled: false,
            cloud_container_id: None,
        }
    }

    /// Descriptor mirrored into a cloud container
    pub fn with_cloud(
        name: impl Into<String>,
        file_path: impl Into<PathBuf>,
        container_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            cloud_enabled: true,
            cloud_container_id: Some(container_id.into()),
        }
    }

    /// Build the descriptor from configuration and the durable sync preference
    pub fn from_config(config: &Config, cloud_sync_requested: bool) -> Self {
        Self {
            name: config.store_name.clone(),
            file_path: config.document_path(),
            cloud_enabled: cloud_sync_requested,
            cloud_container_id: config.cloud_container_id.clone(),
        }
        .normalized()
    }

    /// Coerce `cloud_enabled` off when no container is configured
    pub fn normalized(mut self) -> Self {
        let has_container = self
            .cloud_container_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());

        if self.cloud_enabled && !has_container {
            warn!(store = %self.name, "Cloud sync requested without a container id, opening local-only");
            self.cloud_enabled = false;
        }
        self
    }

    /// Parsed cloud container id, if one is configured
    pub fn container(&self) -> Result<Option<StoreId>, DescriptorError> {
        match self.cloud_container_id.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(id) => StoreId::parse(id)
                .map(Some)
                .map_err(|e| DescriptorError::InvalidContainer {
                    id: id.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Path of the derived SQLite read database
    pub fn projection_path(&self) -> PathBuf {
        self.file_path.with_extension("db")
    }

    /// Check that the store can be written where the descriptor points
    ///
    /// Creates the parent directory if needed.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.file_path.file_name().is_none() {
            return Err(DescriptorError::NoFileName(self.file_path.clone()));
        }

        let parent = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        fs::create_dir_all(parent).map_err(|e| DescriptorError::CreateDirectory {
            path: parent.to_path_buf(),
            source: e,
        })?;

        if is_read_only(parent) {
            return Err(DescriptorError::ReadOnly(parent.to_path_buf()));
        }
        if self.file_path.exists() && is_read_only(&self.file_path) {
            return Err(DescriptorError::ReadOnly(self.file_path.clone()));
        }

        if self.cloud_enabled {
            self.container()?;
        }

        Ok(())
    }
}

fn is_read_only(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_config() {
        let config = Config {
            data_dir: PathBuf::from("/data"),
            store_name: "jobs".to_string(),
            cloud_container_id: Some(StoreId::new().to_string()),
            ..Config::default()
        };

        let descriptor = StoreDescriptor::from_config(&config, true);
        assert_eq!(descriptor.name, "jobs");
        assert_eq!(descriptor.file_path, PathBuf::from("/data/jobs.automerge"));
        assert!(descriptor.cloud_enabled);
        assert_eq!(descriptor.projection_path(), PathBuf::from("/data/jobs.db"));
    }

    #[test]
    fn test_cloud_without_container_is_coerced_off() {
        let config = Config::default();
        let descriptor = StoreDescriptor::from_config(&config, true);
        assert!(!descriptor.cloud_enabled);

        let blank = StoreDescriptor::with_cloud("s", "/tmp/s.automerge", "  ").normalized();
        assert!(!blank.cloud_enabled);
    }

    #[test]
    fn test_equality() {
        let a = StoreDescriptor::local("s", "/tmp/s.automerge");
        let b = StoreDescriptor::local("s", "/tmp/s.automerge");
        assert_eq!(a, b);
        assert_ne!(a, StoreDescriptor::local("t", "/tmp/s.automerge"));
    }

    #[test]
    fn test_container_parsing() {
        let id = StoreId::new();
        let url = StoreDescriptor::with_cloud("s", "/tmp/s.automerge", id.to_url());
        assert_eq!(url.container().unwrap(), Some(id));

        let bad = StoreDescriptor::with_cloud("s", "/tmp/s.automerge", "not-an-id");
        assert!(matches!(
            bad.container(),
            Err(DescriptorError::InvalidContainer { .. })
        ));
        assert!(StoreDescriptor::local("s", "/tmp/s.automerge")
            .container()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_validate_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("s.automerge");
        let descriptor = StoreDescriptor::local("s", &path);

        descriptor.validate().unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_validate_rejects_read_only_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("s.automerge");
        fs::write(&path, b"").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).unwrap();

        let descriptor = StoreDescriptor::local("s", &path);
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_container_when_cloud_on() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor =
            StoreDescriptor::with_cloud("s", temp_dir.path().join("s.automerge"), "???");
        assert!(descriptor.validate().is_err());

        let local = StoreDescriptor {
            cloud_enabled: false,
            ..descriptor
        };
        assert!(local.validate().is_ok());
    }
}
