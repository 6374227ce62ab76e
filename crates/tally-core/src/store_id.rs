//! Store identifiers
//!
//! A `StoreId` names a store document and, when cloud sync is on, the remote
//! container it is mirrored into. It is 16 random bytes rendered as bs58check,
//! the same encoding automerge-repo uses for document IDs.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// URL prefix used by automerge-repo
const URL_PREFIX: &str = "automerge:";

/// Errors parsing a store identifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreIdError {
    #[error("Invalid bs58check encoding: {0}")]
    Encoding(String),

    #[error("Invalid length: expected 16 bytes, got {0}")]
    Length(usize),

    #[error("Not an automerge URL: {0}")]
    NotAUrl(String),
}

/// Identifier for a store document / cloud container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId([u8; 16]);

impl StoreId {
    /// Generate a new random ID
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Build an ID from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encode as bs58check
    pub fn to_bs58check(&self) -> String {
        bs58::encode(&self.0).with_check().into_string()
    }

    /// Decode from bs58check
    pub fn from_bs58check(s: &str) -> Result<Self, StoreIdError> {
        let bytes = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| StoreIdError::Encoding(e.to_string()))?;

        let arr: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreIdError::Length(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Render as an `automerge:` URL
    pub fn to_url(&self) -> String {
        format!("{}{}", URL_PREFIX, self.to_bs58check())
    }

    /// Parse an `automerge:` URL
    pub fn from_url(url: &str) -> Result<Self, StoreIdError> {
        let encoded = url
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| StoreIdError::NotAUrl(url.to_string()))?;
        Self::from_bs58check(encoded)
    }

    /// Parse either a bare bs58check string or an `automerge:` URL
    pub fn parse(s: &str) -> Result<Self, StoreIdError> {
        let s = s.trim();
        if s.starts_with(URL_PREFIX) {
            Self::from_url(s)
        } else {
            Self::from_bs58check(s)
        }
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bs58check())
    }
}

impl FromStr for StoreId {
    type Err = StoreIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
