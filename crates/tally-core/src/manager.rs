//! Store manager
//!
//! The `StoreManager` owns the one open store of a process. It is built
//! explicitly by the host and shared as `Arc<StoreManager>`.
//!
//! ## Contexts
//!
//! - **Owner** (`tokio::sync::Mutex`): the Automerge document, its
//!   persistence and the dirty flag. Every mutation, save, merge and
//!   recreate runs here.
//! - **Reader** (`std::sync::Mutex`): the SQLite projection. The owner
//!   refreshes it after each mutation and merge; queries only take this lock.
//! - **Status** ([`StatusPublisher`]): shared with the cloud event bridge.
//!
//! Lock order is owner, then reader.
//!
//! ## Opening
//!
//! `open` runs a bounded loop. The local phase loads (and migrates) the
//! document and rebuilds the projection; the cloud phase attaches to the
//! backend. Failures are classified and each recovery action runs at most
//! once before the open gives up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{self, CloudEventBridge, Shared, SyncNotification};
use crate::classifier::RecoveryAction;
use crate::cloud::{AttachRequest, CloudBackend, CloudError, CloudEvent, SessionKind};
use crate::descriptor::StoreDescriptor;
use crate::document::{DocumentError, StoreDocument};
use crate::error::{
    OpenError, RecordError, RestartRequired, SaveError, SyncError, SyncOutcome, ToggleError,
};
use crate::failure::ErrorKind;
use crate::models::Record;
use crate::preferences::PreferenceStore;
use crate::status::{StatusInput, SyncStatus};
use crate::storage::{
    DocumentPersistence, RecordQuery, SqliteProjection, StorageResult, StorageStats,
};
use crate::store_id::StoreId;

/// Upper bound on open attempts (initial try plus one per recovery action)
const MAX_OPEN_ATTEMPTS: u32 = 3;

struct OwnedStore {
    doc: StoreDocument,
    persistence: Arc<DocumentPersistence>,
    container: Option<StoreId>,
    dirty: bool,
    /// Failure reported by the last save, if it failed
    save_error: Option<ErrorKind>,
}

impl OwnedStore {
    /// Write the document if dirty, reporting failures on the status
    ///
    /// An error raised by a failed save is cleared by the next successful one.
    fn save(&mut self, shared: &Shared) -> Result<(), SaveError> {
        if !self.dirty {
            debug!("Store is clean, nothing to save");
            return Ok(());
        }

        if let Err(e) = self.persistence.save(&mut self.doc) {
            let kind = ErrorKind::from_storage(&e);
            let action = shared.classifier.classify(&kind);
            error!(
                error = %e,
                kind = %kind,
                action = ?action,
                "Failed to save store, changes kept in memory"
            );
            shared.status.apply(StatusInput::SaveFailed(kind.clone()));
            self.save_error = Some(kind);
            return Err(e.into());
        }
        self.dirty = false;

        if let Some(kind) = self.save_error.take() {
            if shared.status.current() == SyncStatus::Error(kind) {
                info!("Store saved, clearing earlier save failure");
                shared.status.apply(StatusInput::Recovered {
                    cloud: shared.is_cloud_live(),
                });
            }
        }
        Ok(())
    }
}

struct ReadSide {
    descriptor: StoreDescriptor,
    persistence: Arc<DocumentPersistence>,
    projection: SqliteProjection,
}

/// Document and projection produced by the local open phase
struct LocalStore {
    doc: StoreDocument,
    projection: SqliteProjection,
    schema_version: u64,
    record_count: usize,
}

/// Owner of the open store
pub struct StoreManager {
    preferences: Arc<dyn PreferenceStore>,
    backend: Option<Arc<dyn CloudBackend>>,
    shared: Arc<Shared>,
    owner: tokio::sync::Mutex<Option<OwnedStore>>,
    reader: Mutex<Option<ReadSide>>,
    bridge: Mutex<Option<CloudEventBridge>>,
    sync_gate: tokio::sync::Mutex<()>,
    /// Last sync ticket handed out
    sync_requested: AtomicU64,
    /// Highest ticket covered by a completed session
    sync_completed: AtomicU64,
}

impl StoreManager {
    pub fn new(
        preferences: Arc<dyn PreferenceStore>,
        backend: Option<Arc<dyn CloudBackend>>,
    ) -> Self {
        Self {
            preferences,
            backend,
            shared: Arc::new(Shared::new()),
            owner: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            bridge: Mutex::new(None),
            sync_gate: tokio::sync::Mutex::new(()),
            sync_requested: AtomicU64::new(0),
            sync_completed: AtomicU64::new(0),
        }
    }

    fn reader(&self) -> MutexGuard<'_, Option<ReadSide>> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== Lifecycle ====================

    /// Open the store described by `descriptor`
    ///
    /// Opening the same descriptor again is a no-op; a different one is
    /// refused while a store is open.
    pub async fn open(&self, descriptor: StoreDescriptor) -> Result<(), OpenError> {
        let mut owner = self.owner.lock().await;

        if owner.is_some() {
            let current = self.descriptor();
            return match current {
                Some(current) if current == descriptor.clone().normalized() => {
                    debug!(store = %descriptor.name, "Store already open");
                    Ok(())
                }
                Some(current) => Err(OpenError::AlreadyOpen(current.name)),
                None => Err(OpenError::AlreadyOpen(descriptor.name)),
            };
        }

        let descriptor = descriptor.normalized();
        descriptor.validate()?;

        let container = match descriptor.container() {
            Ok(container) => container,
            // Only reachable with cloud off; validate() checked it otherwise
            Err(e) => {
                warn!(error = %e, "Ignoring invalid cloud container id");
                None
            }
        };

        let wants_cloud = descriptor.cloud_enabled && container.is_some();
        if wants_cloud && self.backend.is_none() {
            warn!(store = %descriptor.name, "Cloud sync requested but no backend is configured");
        }
        let mut cloud = wants_cloud && self.backend.is_some();

        info!(
            store = %descriptor.name,
            path = %descriptor.file_path.display(),
            cloud,
            "Opening store"
        );

        let persistence = Arc::new(DocumentPersistence::new(
            descriptor.file_path.clone(),
            descriptor.projection_path(),
        ));

        let mut attempts = 0;
        let mut recreated = false;
        let mut recovered_from: Option<ErrorKind> = None;
        let mut surfaced: Option<ErrorKind> = None;

        let local = loop {
            attempts += 1;

            let local = match open_local(&persistence, container) {
                Ok(local) => local,
                Err(e) => {
                    let kind = ErrorKind::from_storage(&e);
                    warn!(attempt = attempts, error = %e, kind = %kind, "Local store open failed");

                    let action = self.shared.classifier.classify(&kind);
                    if action == RecoveryAction::RecreateStore
                        && !recreated
                        && attempts < MAX_OPEN_ATTEMPTS
                    {
                        recreated = true;
                        self.recreate(&persistence, container, attempts)?;
                        recovered_from.get_or_insert(kind);
                        continue;
                    }
                    return Err(self.give_up(kind, attempts));
                }
            };

            if !cloud {
                break local;
            }
            let (Some(backend), Some(container)) = (&self.backend, container) else {
                break local;
            };

            let request = AttachRequest {
                container,
                store_id: *local.doc.id(),
                schema_version: local.schema_version,
                record_count: local.record_count,
            };
            let Err(e) = backend.attach(&request).await else {
                break local;
            };

            let kind = ErrorKind::from_cloud(&e);
            warn!(attempt = attempts, error = %e, kind = %kind, "Cloud attach failed");

            match self.shared.classifier.classify(&kind) {
                RecoveryAction::RecreateStoreWithoutCloud => {
                    info!(store = %descriptor.name, "Opening local-only, stored data is kept");
                    cloud = false;
                    recovered_from.get_or_insert(kind);
                    break local;
                }
                RecoveryAction::SurfaceToUser(message) => {
                    info!(message = %message, "Store opened, cloud reported a problem");
                    surfaced = Some(kind);
                    break local;
                }
                RecoveryAction::Ignore => break local,
                RecoveryAction::RecreateStore if !recreated && attempts < MAX_OPEN_ATTEMPTS => {
                    recreated = true;
                    drop(local);
                    self.recreate(&persistence, Some(container), attempts)?;
                    recovered_from.get_or_insert(kind);
                }
                RecoveryAction::RecreateStore => return Err(self.give_up(kind, attempts)),
            }
        };

        self.shared.cloud_live.store(cloud, Ordering::SeqCst);

        match recovered_from {
            Some(kind) => {
                self.shared.status.apply(StatusInput::OpenFailed(kind));
                self.shared.status.apply(StatusInput::Recovered { cloud });
            }
            // A retry after a failed open
            None if self.shared.status.current().is_error() => {
                info!(store = %descriptor.name, "Store opened, clearing earlier open failure");
                self.shared.status.apply(StatusInput::Recovered { cloud });
            }
            None => {
                self.shared.status.apply(StatusInput::Opened { cloud });
            }
        }
        if let Some(kind) = surfaced {
            self.shared.status.apply(StatusInput::OpenFailed(kind));
        }

        *self.reader() = Some(ReadSide {
            descriptor: descriptor.clone(),
            persistence: Arc::clone(&persistence),
            projection: local.projection,
        });
        *owner = Some(OwnedStore {
            doc: local.doc,
            persistence,
            container,
            dirty: false,
            save_error: None,
        });
        drop(owner);

        if cloud {
            if let Some(backend) = &self.backend {
                let events = backend.subscribe();
                *self
                    .bridge
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(CloudEventBridge::spawn(Arc::clone(&self.shared), events));
            }
        }

        info!(
            store = %descriptor.name,
            attempts,
            recreated,
            cloud,
            status = %self.current_status(),
            "Store open"
        );
        Ok(())
    }

    fn recreate(
        &self,
        persistence: &DocumentPersistence,
        seed: Option<StoreId>,
        attempts: u32,
    ) -> Result<(), OpenError> {
        warn!(path = %persistence.path().display(), "Recreating store");
        persistence.recreate(seed).map(|_| ()).map_err(|e| {
            error!(error = %e, "Failed to recreate store");
            self.give_up(ErrorKind::from_storage(&e), attempts)
        })
    }

    fn give_up(&self, kind: ErrorKind, attempts: u32) -> OpenError {
        error!(kind = %kind, attempts, "Giving up opening store");
        self.shared
            .status
            .apply(StatusInput::OpenFailed(kind.clone()));
        OpenError::Unrecoverable { kind, attempts }
    }

    /// Persist unsaved changes
    ///
    /// A no-op when nothing changed since the last save. On failure the
    /// changes stay in memory and the next save retries them.
    pub async fn save(&self) -> Result<(), SaveError> {
        let mut owner = self.owner.lock().await;
        owner
            .as_mut()
            .ok_or(SaveError::NotOpen)?
            .save(&self.shared)
    }

    // ==================== Sync ====================

    /// Push local changes to the cloud and pull remote ones
    ///
    /// Saves first. The exchange runs on a fork of the document outside the
    /// owner lock; the fork is merged back afterwards. A request that waited
    /// while a newer session ran to completion returns
    /// [`SyncOutcome::Coalesced`] without starting another.
    pub async fn request_sync(&self) -> Result<SyncOutcome, SyncError> {
        let backend = self.live_backend().ok_or(SyncError::SyncDisabled)?;
        let ticket = self.sync_requested.fetch_add(1, Ordering::SeqCst) + 1;

        let _gate = self.sync_gate.lock().await;
        if self.sync_completed.load(Ordering::SeqCst) >= ticket {
            debug!(ticket, "Sync request covered by a later session");
            return Ok(SyncOutcome::Coalesced);
        }
        if !self.shared.is_cloud_live() {
            return Err(SyncError::SyncDisabled);
        }
        let covers = self.sync_requested.load(Ordering::SeqCst);

        let (container, mut fork) = {
            let mut owner = self.owner.lock().await;
            let store = owner.as_mut().ok_or(SyncError::NotOpen)?;
            store.save(&self.shared)?;
            let container = store.container.ok_or(SyncError::SyncDisabled)?;
            (container, store.doc.fork())
        };

        if self.shared.status.current().is_error() {
            info!("Manual sync requested, clearing sync error");
            self.shared
                .status
                .apply(StatusInput::Recovered { cloud: true });
        }
        self.shared.status.apply(StatusInput::ManualSync);

        let result = match backend.sync(&container, &mut fork).await {
            Ok(report) => self
                .merge_back(&mut fork)
                .await
                .map(|_| report)
                .map_err(|e| CloudError::Document(e.to_string())),
            Err(e) => Err(e),
        };

        bridge::handle_event(
            &self.shared,
            &CloudEvent::SessionEnded(SessionKind::Export, result.as_ref().err().cloned()),
        );

        match result {
            Ok(report) => {
                self.sync_completed.fetch_max(covers, Ordering::SeqCst);
                Ok(SyncOutcome::Completed {
                    remote_changes: report.remote_changes,
                })
            }
            Err(e) => Err(SyncError::Failed(ErrorKind::from_cloud(&e))),
        }
    }

    /// Run [`request_sync`](Self::request_sync) in the background
    pub fn spawn_sync(self: &Arc<Self>) -> JoinHandle<Result<SyncOutcome, SyncError>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.request_sync().await })
    }

    fn live_backend(&self) -> Option<Arc<dyn CloudBackend>> {
        if !self.shared.is_cloud_live() {
            return None;
        }
        self.backend.clone()
    }

    /// Merge a synced fork back into the owned document
    async fn merge_back(&self, fork: &mut StoreDocument) -> StorageResult<bool> {
        let mut owner = self.owner.lock().await;
        let Some(store) = owner.as_mut() else {
            return Ok(false);
        };

        let changed = store.doc.merge(fork)?;
        if !changed {
            return Ok(false);
        }

        if let Some(read) = self.reader().as_mut() {
            read.projection.project_full(&store.doc)?;
        }
        store.dirty = true;
        if let Err(e) = store.save(&self.shared) {
            warn!(error = %e, "Merged remote changes but could not save them yet");
        }
        debug!("Merged remote changes");
        Ok(true)
    }

    /// Record the user's cloud-sync choice for the next launch
    ///
    /// The running store keeps its current wiring.
    pub async fn toggle_cloud_sync(&self, enabled: bool) -> Result<RestartRequired, ToggleError> {
        let descriptor = self.descriptor().ok_or(ToggleError::NotOpen)?;

        let has_container = descriptor
            .cloud_container_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        if !has_container {
            return Err(ToggleError::MissingContainer);
        }

        if enabled {
            let backend = self.backend.as_ref().ok_or(ToggleError::NoBackend)?;
            if let Err(e) = backend.account_status().await {
                let kind = ErrorKind::from_cloud(&e);
                warn!(error = %e, "Cloud account unavailable, not enabling sync");
                return Err(ToggleError::AccountUnavailable(kind));
            }
        }

        self.preferences
            .set_cloud_sync_requested(enabled)
            .map_err(ToggleError::Preference)?;

        info!(store = %descriptor.name, enabled, "Cloud sync preference saved, restart to apply");
        Ok(RestartRequired {
            cloud_sync_requested: enabled,
        })
    }

    // ==================== Status ====================

    pub fn current_status(&self) -> SyncStatus {
        self.shared.status.current()
    }

    /// Receiver holding the latest status
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    /// Call `observer` on every status transition, in order
    ///
    /// The callback runs under the status lock and must not call back into
    /// the manager.
    pub fn observe(&self, observer: impl Fn(&SyncStatus) + Send + Sync + 'static) {
        self.shared.status.observe(Box::new(observer));
    }

    /// Sync completion and failure notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<SyncNotification> {
        self.shared.notifications.subscribe()
    }

    /// Whether the live store is mirrored to the cloud
    ///
    /// Can turn false while running if the cloud rejects the store.
    pub fn is_cloud_enabled(&self) -> bool {
        self.shared.is_cloud_live()
    }

    /// Descriptor of the open store, after normalization
    pub fn descriptor(&self) -> Option<StoreDescriptor> {
        self.reader().as_ref().map(|read| read.descriptor.clone())
    }

    pub fn storage_stats(&self) -> Option<StorageStats> {
        self.reader().as_ref().map(|read| read.persistence.stats())
    }

    pub fn is_open(&self) -> bool {
        self.reader().is_some()
    }

    // ==================== Records ====================

    /// Add a record
    pub async fn insert(&self, record: &Record) -> Result<(), RecordError> {
        let mut owner = self.owner.lock().await;
        let store = owner.as_mut().ok_or(RecordError::NotOpen)?;

        store.doc.add_record(record)?;
        store.dirty = true;
        self.with_projection(|p| p.upsert_record(record))?;

        debug!(id = %record.id, kind = %record.kind, "Inserted record");
        Ok(())
    }

    /// Replace an existing record
    pub async fn update(&self, record: &Record) -> Result<(), RecordError> {
        let mut owner = self.owner.lock().await;
        let store = owner.as_mut().ok_or(RecordError::NotOpen)?;

        store.doc.update_record(record).map_err(not_found)?;
        store.dirty = true;
        self.with_projection(|p| p.upsert_record(record))?;

        debug!(id = %record.id, "Updated record");
        Ok(())
    }

    /// Delete a record
    pub async fn delete(&self, id: Uuid) -> Result<(), RecordError> {
        let mut owner = self.owner.lock().await;
        let store = owner.as_mut().ok_or(RecordError::NotOpen)?;

        store.doc.delete_record(id).map_err(not_found)?;
        store.dirty = true;
        self.with_projection(|p| p.remove_record(id))?;

        debug!(id = %id, "Deleted record");
        Ok(())
    }

    fn with_projection<T>(
        &self,
        f: impl FnOnce(&mut SqliteProjection) -> StorageResult<T>,
    ) -> Result<T, RecordError> {
        let mut reader = self.reader();
        let read = reader.as_mut().ok_or(RecordError::NotOpen)?;
        Ok(f(&mut read.projection)?)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Record>, RecordError> {
        self.with_projection(|p| p.get(id))
    }

    /// All records, optionally of one kind, newest first
    pub fn list(&self, kind: Option<&str>) -> Result<Vec<Record>, RecordError> {
        self.with_projection(|p| p.list(kind))
    }

    pub fn query(&self, query: &RecordQuery) -> Result<Vec<Record>, RecordError> {
        self.with_projection(|p| p.query(query))
    }

    /// Records of `kind` matching an arbitrary predicate
    pub fn filter(
        &self,
        kind: &str,
        predicate: impl Fn(&Record) -> bool,
    ) -> Result<Vec<Record>, RecordError> {
        let records = self.list(Some(kind))?;
        Ok(records.into_iter().filter(|r| predicate(r)).collect())
    }

    /// Full-text search over string fields
    pub fn search(&self, text: &str) -> Result<Vec<Record>, RecordError> {
        self.with_projection(|p| p.search(text))
    }

    pub fn count(&self, kind: Option<&str>) -> Result<usize, RecordError> {
        let count = self.with_projection(|p| p.count(kind))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn not_found(error: DocumentError) -> RecordError {
    match error {
        DocumentError::RecordNotFound(id) => RecordError::NotFound(id),
        other => RecordError::Document(other),
    }
}

/// Load the document and rebuild the projection
fn open_local(
    persistence: &DocumentPersistence,
    seed: Option<StoreId>,
) -> StorageResult<LocalStore> {
    let mut doc = persistence.load_or_create(seed)?;
    if let Some(seed) = seed {
        if *doc.id() != seed {
            // Created before a container was configured
            doc = persistence.adopt(&doc, seed)?;
        }
    }

    let mut projection = match SqliteProjection::open(persistence.projection_path()) {
        Ok(projection) => projection,
        Err(e) => {
            // Derived data, safe to throw away
            warn!(error = %e, "Projection unreadable, rebuilding");
            persistence.remove_projection()?;
            SqliteProjection::open(persistence.projection_path())?
        }
    };
    projection.project_full(&doc)?;

    let schema_version = doc.schema_version()?;
    let record_count = doc.record_count()?;
    debug!(store_id = %doc.id(), schema_version, record_count, "Local store ready");

    Ok(LocalStore {
        doc,
        projection,
        schema_version,
        record_count,
    })
}
