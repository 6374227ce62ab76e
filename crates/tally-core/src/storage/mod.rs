//! Storage layer
//!
//! Handles Automerge document persistence and the SQLite projection.
//!
//! ## Architecture
//!
//! - **Automerge**: Source of truth, stored as binary file
//! - **SQLite**: Read-optimized projection for fast queries
//!
//! When the Automerge document changes, the SQLite database is updated
//! to reflect the new state.

pub mod error;
pub mod persistence;
pub mod projection;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use persistence::{DocumentPersistence, StorageStats};
pub use projection::{RecordQuery, SqliteProjection};
pub use schema::SCHEMA_VERSION;
