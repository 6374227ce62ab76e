//! In-process cloud backend
//!
//! Keeps one Automerge replica per container, either in memory or as files
//! in a directory (`file://` sync URLs). Several stores pointing at the same
//! directory behave like devices sharing one cloud container.
//!
//! The backend enforces what a real service would: a container stays bound
//! to the store that first synced into it, and an optional minimum schema
//! version. Failure hooks let tests script account, network and rejection
//! errors.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    AttachRequest, CloudBackend, CloudError, CloudEvent, SessionKind, SyncReport,
    EVENT_CHANNEL_CAPACITY,
};
use crate::document::StoreDocument;
use crate::storage::persistence::atomic_write;
use crate::store_id::StoreId;

enum Replicas {
    Memory(Mutex<HashMap<StoreId, Vec<u8>>>),
    Directory(PathBuf),
}

impl Replicas {
    fn read(&self, container: &StoreId) -> Result<Option<Vec<u8>>, CloudError> {
        match self {
            Replicas::Memory(map) => Ok(lock(map).get(container).cloned()),
            Replicas::Directory(dir) => {
                let path = replica_path(dir, container);
                if !path.exists() {
                    return Ok(None);
                }
                fs::read(&path)
                    .map(Some)
                    .map_err(|e| CloudError::Io(format!("{}: {}", path.display(), e)))
            }
        }
    }

    fn write(&self, container: &StoreId, bytes: Vec<u8>) -> Result<(), CloudError> {
        match self {
            Replicas::Memory(map) => {
                lock(map).insert(*container, bytes);
                Ok(())
            }
            Replicas::Directory(dir) => {
                let path = replica_path(dir, container);
                atomic_write(&path, &bytes).map_err(|e| CloudError::Io(e.to_string()))
            }
        }
    }
}

fn replica_path(dir: &std::path::Path, container: &StoreId) -> PathBuf {
    dir.join(format!("{}.automerge", container.to_bs58check()))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Faults {
    attach: Option<CloudError>,
    sync: Option<CloudError>,
}

/// Cloud backend that keeps replicas locally
pub struct LoopbackCloud {
    replicas: Replicas,
    events: broadcast::Sender<CloudEvent>,
    faults: Mutex<Faults>,
    account_available: AtomicBool,
    required_schema: Option<u64>,
    attaches: AtomicUsize,
    syncs: AtomicUsize,
}

impl LoopbackCloud {
    fn with_replicas(replicas: Replicas) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            replicas,
            events,
            faults: Mutex::new(Faults::default()),
            account_available: AtomicBool::new(true),
            required_schema: None,
            attaches: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        }
    }

    /// Replicas held in memory
    pub fn in_memory() -> Self {
        Self::with_replicas(Replicas::Memory(Mutex::new(HashMap::new())))
    }

    /// Replicas stored as files under `dir`
    pub fn in_directory(dir: PathBuf) -> Self {
        Self::with_replicas(Replicas::Directory(dir))
    }

    /// Reject stores whose schema version differs from `version`
    pub fn requiring_schema(mut self, version: u64) -> Self {
        self.required_schema = Some(version);
        self
    }

    /// Fail the next `attach` with `error`
    pub fn fail_next_attach(&self, error: CloudError) {
        lock(&self.faults).attach = Some(error);
    }

    /// Fail the next `sync` with `error`
    pub fn fail_next_sync(&self, error: CloudError) {
        lock(&self.faults).sync = Some(error);
    }

    /// Simulate signing in or out of the cloud account
    pub fn set_account_available(&self, available: bool) {
        self.account_available.store(available, Ordering::SeqCst);
    }

    /// Emit an event as if a remote session happened
    pub fn emit(&self, event: CloudEvent) {
        let _ = self.events.send(event);
    }

    /// Number of `attach` calls so far
    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// Number of `sync` calls so far
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Load the remote replica for a container
    pub fn replica(&self, container: &StoreId) -> Result<Option<StoreDocument>, CloudError> {
        self.replicas
            .read(container)?
            .map(|bytes| StoreDocument::load(&bytes))
            .transpose()
            .map_err(|e| CloudError::Document(e.to_string()))
    }

    fn check_account(&self) -> Result<(), CloudError> {
        if self.account_available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CloudError::Rejected(
                "cloud account unavailable: not signed in".to_string(),
            ))
        }
    }

    fn check_attach(&self, request: &AttachRequest) -> Result<(), CloudError> {
        if let Some(error) = lock(&self.faults).attach.take() {
            return Err(error);
        }
        self.check_account()?;

        if let Some(required) = self.required_schema {
            if request.schema_version != required {
                return Err(CloudError::Rejected(format!(
                    "cloud integration requires schema version {} (store has {})",
                    required, request.schema_version
                )));
            }
        }

        if let Some(remote) = self.replica(&request.container)? {
            if *remote.id() != request.store_id {
                return Err(CloudError::Rejected(format!(
                    "container {} is bound to a different store",
                    request.container
                )));
            }
        }
        Ok(())
    }

    fn exchange(
        &self,
        container: &StoreId,
        doc: &mut StoreDocument,
    ) -> Result<SyncReport, CloudError> {
        if let Some(error) = lock(&self.faults).sync.take() {
            return Err(error);
        }
        self.check_account()?;

        let mut remote_changes = false;
        if let Some(mut remote) = self.replica(container)? {
            if remote.id() != doc.id() {
                return Err(CloudError::Rejected(format!(
                    "container {} is bound to a different store",
                    container
                )));
            }
            remote_changes = doc
                .merge(&mut remote)
                .map_err(|e| CloudError::Document(e.to_string()))?;
        }

        self.replicas.write(container, doc.save())?;
        debug!(container = %container, remote_changes, "Loopback sync complete");
        Ok(SyncReport { remote_changes })
    }
}

#[async_trait]
impl CloudBackend for LoopbackCloud {
    async fn attach(&self, request: &AttachRequest) -> Result<(), CloudError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        self.emit(CloudEvent::SessionStarted(SessionKind::Setup));

        let result = self.check_attach(request);
        if result.is_ok() {
            info!(container = %request.container, records = request.record_count, "Attached to loopback cloud");
        }

        self.emit(CloudEvent::SessionEnded(
            SessionKind::Setup,
            result.as_ref().err().cloned(),
        ));
        result
    }

    async fn sync(
        &self,
        container: &StoreId,
        doc: &mut StoreDocument,
    ) -> Result<SyncReport, CloudError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        self.emit(CloudEvent::SessionStarted(SessionKind::Export));

        let result = self.exchange(container, doc);

        self.emit(CloudEvent::SessionEnded(
            SessionKind::Export,
            result.as_ref().err().cloned(),
        ));
        result
    }

    async fn account_status(&self) -> Result<(), CloudError> {
        self.check_account()
    }

    fn subscribe(&self) -> broadcast::Receiver<CloudEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::CURRENT_SCHEMA_VERSION;
    use crate::models::Record;
    use tempfile::TempDir;

    fn request(container: StoreId, doc: &StoreDocument) -> AttachRequest {
        AttachRequest {
            container,
            store_id: *doc.id(),
            schema_version: CURRENT_SCHEMA_VERSION,
            record_count: doc.record_count().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_attach_and_sync_emit_sessions() {
        let cloud = LoopbackCloud::in_memory();
        let mut events = cloud.subscribe();
        let container = StoreId::new();
        let mut doc = StoreDocument::with_id(container).unwrap();

        cloud.attach(&request(container, &doc)).await.unwrap();
        cloud.sync(&container, &mut doc).await.unwrap();

        let expected = [
            CloudEvent::SessionStarted(SessionKind::Setup),
            CloudEvent::SessionEnded(SessionKind::Setup, None),
            CloudEvent::SessionStarted(SessionKind::Export),
            CloudEvent::SessionEnded(SessionKind::Export, None),
        ];
        for event in expected {
            assert_eq!(events.recv().await.unwrap(), event);
        }
        assert_eq!(cloud.attach_count(), 1);
        assert_eq!(cloud.sync_count(), 1);
    }

    #[tokio::test]
    async fn test_two_devices_converge() {
        let temp_dir = TempDir::new().unwrap();
        let cloud = LoopbackCloud::in_directory(temp_dir.path().to_path_buf());
        let container = StoreId::new();

        let mut device_a = StoreDocument::with_id(container).unwrap();
        let mut device_b = StoreDocument::with_id(container).unwrap();
        device_a
            .add_record(&Record::new("project").with_field("name", "A"))
            .unwrap();
        device_b
            .add_record(&Record::new("project").with_field("name", "B"))
            .unwrap();

        let first = cloud.sync(&container, &mut device_a).await.unwrap();
        assert!(!first.remote_changes);

        let second = cloud.sync(&container, &mut device_b).await.unwrap();
        assert!(second.remote_changes);
        assert_eq!(device_b.record_count().unwrap(), 2);

        cloud.sync(&container, &mut device_a).await.unwrap();
        assert_eq!(device_a.record_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_container_bound_to_other_store_is_rejected() {
        let cloud = LoopbackCloud::in_memory();
        let container = StoreId::new();

        let mut owner = StoreDocument::with_id(container).unwrap();
        cloud.sync(&container, &mut owner).await.unwrap();

        let stranger = StoreDocument::new().unwrap();
        let err = cloud
            .attach(&request(container, &stranger))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Rejected(msg) if msg.contains("different store")));
    }

    #[tokio::test]
    async fn test_required_schema() {
        let cloud = LoopbackCloud::in_memory().requiring_schema(CURRENT_SCHEMA_VERSION + 1);
        let container = StoreId::new();
        let doc = StoreDocument::with_id(container).unwrap();

        let err = cloud.attach(&request(container, &doc)).await.unwrap_err();
        assert!(matches!(err, CloudError::Rejected(msg) if msg.contains("requires schema")));
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let cloud = LoopbackCloud::in_memory();
        let container = StoreId::new();
        let mut doc = StoreDocument::with_id(container).unwrap();

        cloud.fail_next_sync(CloudError::Connection("offline".to_string()));
        assert!(cloud.sync(&container, &mut doc).await.is_err());
        assert!(cloud.sync(&container, &mut doc).await.is_ok());
    }

    #[tokio::test]
    async fn test_account_unavailable() {
        let cloud = LoopbackCloud::in_memory();
        cloud.set_account_available(false);
        assert!(cloud.account_status().await.is_err());

        let container = StoreId::new();
        let doc = StoreDocument::with_id(container).unwrap();
        assert!(cloud.attach(&request(container, &doc)).await.is_err());

        cloud.set_account_available(true);
        assert!(cloud.account_status().await.is_ok());
    }
}
