//! Peer sync state persistence
//!
//! Stores Automerge sync states per server peer between sessions so later
//! syncs only exchange what changed.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use automerge::sync::State as AutomergeSyncState;
use tracing::warn;

use crate::storage::persistence::atomic_write;

/// Sync states for every peer we've synced with
#[derive(Debug, Default)]
pub struct PeerSyncStates {
    peers: HashMap<String, AutomergeSyncState>,
    path: Option<PathBuf>,
}

impl PeerSyncStates {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted as JSON at `path`, loading what is already there
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let mut state = Self {
            peers: HashMap::new(),
            path: Some(path),
        };
        state.load()?;
        Ok(state)
    }

    /// Get or create sync state for a peer
    pub fn get_or_create(&mut self, peer_id: &str) -> &mut AutomergeSyncState {
        self.peers.entry(peer_id.to_string()).or_default()
    }

    /// Get sync state for a peer (if exists)
    pub fn get(&self, peer_id: &str) -> Option<&AutomergeSyncState> {
        self.peers.get(peer_id)
    }

    /// Drop the state for a peer, forcing a full exchange next time
    pub fn forget(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    /// Save state to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let data: HashMap<&str, Vec<u8>> = self
            .peers
            .iter()
            .map(|(k, v)| (k.as_str(), v.encode()))
            .collect();
        let json = serde_json::to_string(&data)?;

        atomic_write(path, json.as_bytes()).context("Failed to save sync state")?;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let json = fs::read_to_string(path).context("Failed to read sync state")?;
        let data: HashMap<String, Vec<u8>> =
            serde_json::from_str(&json).context("Failed to parse sync state")?;

        for (peer_id, bytes) in data {
            match AutomergeSyncState::decode(&bytes) {
                Ok(state) => {
                    self.peers.insert(peer_id, state);
                }
                Err(e) => warn!(peer = %peer_id, error = %e, "Discarding unreadable sync state"),
            }
        }

        Ok(())
    }

    /// Number of peers we have state for
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_peer_has_no_heads() {
        let mut state = PeerSyncStates::new();
        let peer_state = state.get_or_create("peer-1");
        assert!(peer_state.their_heads.is_none());
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync_state.json");

        {
            let mut state = PeerSyncStates::with_path(path.clone()).unwrap();
            state.get_or_create("peer-1");
            state.save().unwrap();
        }

        let state = PeerSyncStates::with_path(path).unwrap();
        assert_eq!(state.peer_count(), 1);
        assert!(state.get("peer-1").is_some());
    }

    #[test]
    fn test_forget() {
        let mut state = PeerSyncStates::new();
        state.get_or_create("peer-1");
        state.get_or_create("peer-2");
        state.forget("peer-1");

        assert_eq!(state.peer_count(), 1);
        assert!(state.get("peer-1").is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync_state.json");
        fs::write(&path, "{not json").unwrap();

        assert!(PeerSyncStates::with_path(path).is_err());
    }
}
