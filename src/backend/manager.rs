//! The backend manager: registry, object operations, and migration.
//!
//! One explicitly-owned [`BackendManager`] value is shared (behind `Arc`)
//! by the listener, every session worker, and the maintenance thread —
//! there is no process-wide singleton. The manager owns the global index
//! and every registered backend; entries are shared out of it as `Arc`s.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::backend::maintenance::{self, MaintenanceConfig, MaintenanceHandle};
use crate::backend::{
    backend_flags, Backend, BackendConfig, BackendError, BackendResult, BackendStatus,
    BackendType, MigrationPolicy, Watermarks,
};
use crate::index::entry::{backing_path, unix_millis};
use crate::index::{BackendIndex, FdRef, GlobalIndex, IndexEntry, PayloadDescriptor};
use crate::protocol::MAX_URI_LEN;

/// Parameters for creating one object
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Object URI (must start with `/`)
    pub uri: String,

    /// Explicit target backend; `None` auto-selects by role
    pub backend_id: Option<u8>,

    /// Confine the object to the ephemeral tier
    pub ephemeral: bool,
}

/// Metadata snapshot of one object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Size in bytes
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    /// Backend currently holding the bytes
    pub backend_id: u8,
    /// Payload descriptor, if published
    pub payload: Option<PayloadDescriptor>,
}

/// Listing row for one object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object URI
    pub uri: String,
    /// Backend currently holding the bytes
    pub backend_id: u8,
    /// Size in bytes
    pub size: u64,
    /// Ephemeral discipline flag
    pub ephemeral: bool,
    /// Total accesses
    pub access_count: u64,
    /// Current hotness in [0, 1]
    pub hotness: f64,
}

/// One row of the hotness map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotnessSample {
    /// Object URI
    pub uri: String,
    /// Backend currently holding the bytes
    pub backend_id: u8,
    /// Current hotness in [0, 1]
    pub hotness: f64,
    /// Last access, milliseconds since the epoch
    pub last_access_ms: u64,
}

/// Serialisable manager status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    /// Status of every registered backend
    pub backends: Vec<BackendStatus>,
    /// Default backend id, if set
    pub default_backend: Option<u8>,
    /// Ephemeral backend id, if set
    pub ephemeral_backend: Option<u8>,
    /// Cache backend id, if set
    pub cache_backend: Option<u8>,
    /// Whether the maintenance loop is running
    pub cache_running: bool,
    /// Objects in the global index
    pub total_objects: usize,
    /// Bytes across all backends
    pub total_bytes: u64,
}

/// Serialisable manager counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatsSnapshot {
    /// Objects created
    pub objects_created: u64,
    /// Objects deleted
    pub objects_deleted: u64,
    /// Object reads served
    pub reads: u64,
    /// Object writes
    pub writes: u64,
    /// Explicit migrations completed
    pub migrations: u64,
    /// Objects promoted into the cache tier
    pub cache_promotions: u64,
    /// Objects evicted from the cache tier
    pub cache_evictions: u64,
}

#[derive(Debug, Default)]
struct ManagerCounters {
    objects_created: AtomicU64,
    objects_deleted: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    migrations: AtomicU64,
    cache_promotions: AtomicU64,
    cache_evictions: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Roles {
    default: Option<u8>,
    ephemeral: Option<u8>,
    cache: Option<u8>,
}

/// Registry of storage backends plus every object operation
pub struct BackendManager {
    backends: RwLock<HashMap<u8, Arc<Backend>>>,
    global: GlobalIndex,
    roles: RwLock<Roles>,
    cache_running: Arc<AtomicBool>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
    counters: ManagerCounters,
}

impl BackendManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            global: GlobalIndex::new(),
            roles: RwLock::new(Roles::default()),
            cache_running: Arc::new(AtomicBool::new(false)),
            maintenance: Mutex::new(None),
            counters: ManagerCounters::default(),
        }
    }

    // ---- registry -------------------------------------------------------

    /// Register a backend, creating its mount directory and rebuilding its
    /// index from the persisted file when one is present and valid.
    /// The first non-ephemeral-only backend becomes the default.
    pub fn register_backend(&self, config: BackendConfig) -> BackendResult<Arc<Backend>> {
        config.watermarks.validate()?;
        {
            let backends = self.backends.read();
            if backends.contains_key(&config.id) {
                return Err(BackendError::DuplicateBackend(config.id));
            }
        }
        std::fs::create_dir_all(&config.mount_path)?;
        let backend = Arc::new(Backend::from_config(&config));

        if let Some(records) = BackendIndex::load_records(&config.mount_path)? {
            let mut restored = 0usize;
            for record in records {
                if !record.path.is_file() {
                    log::debug!("Dropping stale index record for {}", record.uri);
                    continue;
                }
                if self.global.get(&record.uri).is_some() {
                    log::warn!(
                        "URI {} already indexed elsewhere, skipping persisted record",
                        record.uri
                    );
                    continue;
                }
                let size = record.size;
                let entry = Arc::new(IndexEntry::from_record(record));
                self.global.insert(Arc::clone(&entry));
                backend.index().insert(entry);
                backend.add_used(size);
                restored += 1;
            }
            backend.index().clear_dirty();
            log::info!(
                "Backend {} restored {restored} objects from its persisted index",
                config.id
            );
        }

        self.backends.write().insert(config.id, Arc::clone(&backend));
        let mut roles = self.roles.write();
        if roles.default.is_none() && !backend.is_ephemeral_only() {
            roles.default = Some(config.id);
            log::info!("Backend {} selected as default", config.id);
        }
        log::info!(
            "Registered backend {} ({:?}) at {}",
            config.id,
            backend.backend_type(),
            backend.mount_path().display()
        );
        Ok(backend)
    }

    /// Look up a registered backend
    pub fn backend(&self, id: u8) -> BackendResult<Arc<Backend>> {
        self.backends
            .read()
            .get(&id)
            .cloned()
            .ok_or(BackendError::BackendNotFound(id))
    }

    /// Snapshot of all registered backends
    pub fn backends_snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends.read().values().cloned().collect()
    }

    /// Select the default backend for non-ephemeral creation
    pub fn set_default_backend(&self, id: u8) -> BackendResult<()> {
        let backend = self.backend(id)?;
        if backend.is_ephemeral_only() {
            return Err(BackendError::InvalidConfig(
                "default backend must accept persistent objects".into(),
            ));
        }
        self.roles.write().default = Some(id);
        Ok(())
    }

    /// Select the backend ephemeral objects are confined to
    pub fn set_ephemeral_backend(&self, id: u8) -> BackendResult<()> {
        let backend = self.backend(id)?;
        if !backend.is_ephemeral_only() {
            return Err(BackendError::InvalidConfig(
                "ephemeral backend must be flagged ephemeral-only".into(),
            ));
        }
        self.roles.write().ephemeral = Some(id);
        Ok(())
    }

    /// Select the cache backend hot objects are promoted into
    pub fn set_cache_backend(&self, id: u8) -> BackendResult<()> {
        let backend = self.backend(id)?;
        if backend.is_ephemeral_only() {
            // An ephemeral-only cache could never hold promoted persistent
            // objects, so the role would be useless.
            return Err(BackendError::InvalidConfig(
                "cache backend must not be ephemeral-only".into(),
            ));
        }
        if backend.backend_type() != BackendType::Memory {
            log::warn!(
                "Cache backend {id} is {:?}, not memory-tier",
                backend.backend_type()
            );
        }
        self.roles.write().cache = Some(id);
        Ok(())
    }

    /// The cache backend, if one is selected
    pub fn cache_backend(&self) -> Option<Arc<Backend>> {
        let id = self.roles.read().cache?;
        self.backends.read().get(&id).cloned()
    }

    /// The global index (sessions resolve URIs through the manager)
    pub(crate) fn global(&self) -> &GlobalIndex {
        &self.global
    }

    // ---- object operations ---------------------------------------------

    /// Create (or replace) an object and return a writable borrow of its
    /// freshly created descriptor
    pub fn create_object(&self, request: CreateRequest) -> BackendResult<FdRef> {
        validate_uri(&request.uri)?;

        let backend = match request.backend_id {
            Some(id) => self.backend(id)?,
            None => {
                let roles = *self.roles.read();
                let id = if request.ephemeral {
                    roles.ephemeral.ok_or_else(|| {
                        BackendError::Policy("no ephemeral backend registered".into())
                    })?
                } else {
                    roles
                        .default
                        .ok_or_else(|| BackendError::Policy("no default backend".into()))?
                };
                self.backend(id)?
            }
        };

        if !backend.is_enabled() {
            return Err(BackendError::Policy(format!(
                "backend {} is disabled",
                backend.id()
            )));
        }
        if backend.is_readonly() {
            return Err(BackendError::Policy(format!(
                "backend {} is read-only",
                backend.id()
            )));
        }
        if request.ephemeral != backend.is_ephemeral_only() {
            return Err(BackendError::Policy(if request.ephemeral {
                format!("backend {} does not accept ephemeral objects", backend.id())
            } else {
                format!("backend {} accepts only ephemeral objects", backend.id())
            }));
        }

        // PUT replaces: clear out any previous object under this URI.
        match self.delete_object(&request.uri) {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let path = backing_path(backend.mount_path(), &request.uri);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| BackendError::Storage(format!("create {}: {e}", path.display())))?;

        let entry = Arc::new(IndexEntry::new(
            request.uri.clone(),
            backend.id(),
            path,
            0,
            unix_millis() / 1000,
            request.ephemeral,
        ));
        entry.install_fd(Arc::new(OwnedFd::from(file)));

        self.global.insert(Arc::clone(&entry));
        backend.index().insert(Arc::clone(&entry));
        backend.stats().writes.fetch_add(1, Ordering::Relaxed);
        self.counters.objects_created.fetch_add(1, Ordering::Relaxed);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "Created object {} on backend {}",
            request.uri,
            backend.id()
        );
        entry.acquire_fd().map_err(BackendError::from)
    }

    /// Resolve an object and borrow its descriptor, recording the access
    pub fn get_object(&self, uri: &str) -> BackendResult<FdRef> {
        let entry = self.lookup(uri)?;
        let fd_ref = entry.acquire_fd()?;
        entry.record_access();
        if let Ok(backend) = self.backend(entry.backend_id()) {
            backend.stats().reads.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(fd_ref)
    }

    /// Delete an object: unindex it, unlink the file, and let the entry
    /// linger until the last borrow drops
    pub fn delete_object(&self, uri: &str) -> BackendResult<()> {
        let entry = self
            .global
            .remove(uri)
            .ok_or_else(|| BackendError::NotFound(uri.to_string()))?;
        entry.mark_deleted();

        let path = entry.backend_path();
        if let Ok(backend) = self.backend(entry.backend_id()) {
            backend.index().remove(uri);
            backend.sub_used(entry.size());
        }
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Unlink {} failed: {e}", path.display());
            }
        }
        self.counters.objects_deleted.fetch_add(1, Ordering::Relaxed);
        log::debug!("Deleted object {uri}");
        Ok(())
    }

    /// Record a new size after a write, adjusting the backend accounting
    /// and seeding an identity payload descriptor for non-empty objects
    pub fn update_size(&self, uri: &str, size: u64) -> BackendResult<()> {
        let entry = self.lookup(uri)?;
        let old = entry.set_size(size);
        entry.touch_mtime(unix_millis() / 1000);
        if let Ok(backend) = self.backend(entry.backend_id()) {
            if size >= old {
                backend.add_used(size - old);
            } else {
                backend.sub_used(old - size);
            }
            backend.index().mark_dirty();
            backend.stats().writes.fetch_add(1, Ordering::Relaxed);
        }
        entry.seed_identity_payload();
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Validate and publish a payload descriptor
    pub fn set_payload_metadata(
        &self,
        uri: &str,
        descriptor: PayloadDescriptor,
    ) -> BackendResult<()> {
        descriptor
            .validate()
            .map_err(crate::index::IndexError::from)?;
        let entry = self.lookup(uri)?;
        entry.set_payload(descriptor);
        if let Ok(backend) = self.backend(entry.backend_id()) {
            backend.index().mark_dirty();
        }
        Ok(())
    }

    /// Read-only payload descriptor fetch
    pub fn get_payload_metadata(&self, uri: &str) -> BackendResult<Option<PayloadDescriptor>> {
        Ok(self.lookup(uri)?.payload())
    }

    /// Metadata snapshot of one object
    pub fn get_metadata(&self, uri: &str) -> BackendResult<ObjectMetadata> {
        let entry = self.lookup(uri)?;
        Ok(ObjectMetadata {
            size: entry.size(),
            mtime: entry.mtime(),
            backend_id: entry.backend_id(),
            payload: entry.payload(),
        })
    }

    /// Shared entry lookup used by sessions
    pub fn lookup(&self, uri: &str) -> BackendResult<Arc<IndexEntry>> {
        let entry = self
            .global
            .get(uri)
            .ok_or_else(|| BackendError::NotFound(uri.to_string()))?;
        if entry.is_deleted() {
            return Err(BackendError::NotFound(uri.to_string()));
        }
        Ok(entry)
    }

    // ---- migration ------------------------------------------------------

    /// Explicitly migrate an object to another backend
    pub fn migrate_object(&self, uri: &str, target_id: u8) -> BackendResult<()> {
        let entry = self.lookup(uri)?;
        let dst = self.backend(target_id)?;
        self.migrate_to(&entry, &dst, true)?;
        self.counters.migrations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Promote an object into the cache backend
    pub fn cache_object(&self, uri: &str) -> BackendResult<()> {
        let cache = self
            .cache_backend()
            .ok_or_else(|| BackendError::Policy("no cache backend selected".into()))?;
        let entry = self.lookup(uri)?;
        if entry.is_ephemeral() {
            return Err(BackendError::Policy(
                "ephemeral objects are never promoted".into(),
            ));
        }
        if entry.backend_id() == cache.id() {
            return Err(BackendError::Policy(format!("{uri} is already cached")));
        }
        self.migrate_to(&entry, &cache, false)?;
        self.counters.cache_promotions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Demote an object out of the cache backend, back to its home
    /// backend when possible, otherwise to the default backend
    pub fn evict_object(&self, uri: &str) -> BackendResult<()> {
        let cache = self
            .cache_backend()
            .ok_or_else(|| BackendError::Policy("no cache backend selected".into()))?;
        let entry = self.lookup(uri)?;
        if entry.backend_id() != cache.id() {
            return Err(BackendError::Policy(format!("{uri} is not cached")));
        }

        let home = self.backend(entry.home_backend_id()).ok().filter(|b| {
            b.id() != cache.id() && b.is_enabled() && !b.is_readonly() && !b.is_ephemeral_only()
        });
        let target = match home {
            Some(backend) => backend,
            None => {
                let id = self
                    .roles
                    .read()
                    .default
                    .ok_or_else(|| BackendError::Policy("no eviction target".into()))?;
                self.backend(id)?
            }
        };

        self.migrate_to(&entry, &target, false)?;
        self.counters.cache_evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Migration core shared by explicit migration and cache traffic.
    /// `enforce_flags` applies the MIGRATION_SRC/DST discipline; cache
    /// promotion/eviction is governed by the cache role instead. The
    /// ephemeral discipline always applies.
    fn migrate_to(
        &self,
        entry: &Arc<IndexEntry>,
        dst: &Arc<Backend>,
        enforce_flags: bool,
    ) -> BackendResult<()> {
        let src = self.backend(entry.backend_id())?;
        if src.id() == dst.id() {
            return Err(BackendError::Migration(format!(
                "{} already resides on backend {}",
                entry.uri(),
                dst.id()
            )));
        }

        if entry.is_ephemeral() {
            if !dst.is_ephemeral_only() {
                return Err(BackendError::Policy(
                    "ephemeral object may only migrate to an ephemeral-only backend".into(),
                ));
            }
            if !src.is_ephemeral_only() {
                // Data already on persistent media may not be declared
                // ephemeral after the fact.
                return Err(BackendError::Policy(
                    "object on a persistent backend cannot enter the ephemeral tier".into(),
                ));
            }
        } else if dst.is_ephemeral_only() {
            return Err(BackendError::Policy(
                "ephemeral-only backend accepts only ephemeral objects".into(),
            ));
        }

        if !dst.is_enabled() {
            return Err(BackendError::Policy(format!(
                "backend {} is disabled",
                dst.id()
            )));
        }
        if dst.is_readonly() {
            return Err(BackendError::Policy(format!(
                "backend {} is read-only",
                dst.id()
            )));
        }
        if enforce_flags {
            if !src.has_flag(backend_flags::MIGRATION_SRC) {
                return Err(BackendError::Policy(format!(
                    "backend {} is not a migration source",
                    src.id()
                )));
            }
            if !dst.has_flag(backend_flags::MIGRATION_DST) {
                return Err(BackendError::Policy(format!(
                    "backend {} is not a migration destination",
                    dst.id()
                )));
            }
            if src.migration_policy() == MigrationPolicy::Disabled
                || dst.migration_policy() == MigrationPolicy::Disabled
            {
                return Err(BackendError::Policy(
                    "migration disabled by backend policy".into(),
                ));
            }
        }

        let size = entry.size();
        if dst.capacity() > 0 && dst.used_bytes().saturating_add(size) > dst.capacity() {
            return Err(BackendError::Storage(format!(
                "backend {} cannot hold {size} more bytes",
                dst.id()
            )));
        }

        let uri = entry.uri().to_string();
        let dest_path = backing_path(dst.mount_path(), &uri);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dest_path)
            .map_err(|e| BackendError::Storage(format!("create {}: {e}", dest_path.display())))?;

        // Readers holding an FdRef keep the old descriptor; the copy reads
        // the same bytes they do.
        let src_ref = entry.acquire_fd()?;
        let copy_result =
            copy_fd_contents(src_ref.raw_fd(), &dest_file, size).and_then(|copied| {
                if copied != size {
                    Err(BackendError::Migration(format!(
                        "short copy: {copied} of {size} bytes"
                    )))
                } else {
                    dest_file.sync_all().map_err(BackendError::from)
                }
            });
        drop(src_ref);

        if let Err(e) = copy_result {
            drop(dest_file);
            let _ = std::fs::remove_file(&dest_path);
            return Err(e);
        }

        // Commit: repoint the shared entry, move it between the backend
        // indexes, fix accounting, then unlink the source file. The global
        // entry identity is preserved throughout.
        let old_path = entry.backend_path();
        entry.repoint(dst.id(), dest_path);
        src.index().remove(&uri);
        dst.index().insert(Arc::clone(entry));
        src.sub_used(size);
        dst.add_used(size);
        src.stats().migrations_out.fetch_add(1, Ordering::Relaxed);
        dst.stats().migrations_in.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = std::fs::remove_file(&old_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Unlink migrated source {} failed: {e}", old_path.display());
            }
        }
        log::debug!("Migrated {uri} from backend {} to {}", src.id(), dst.id());
        Ok(())
    }

    // ---- maintenance control -------------------------------------------

    /// Start the cache-maintenance loop
    pub fn start_caching(self: &Arc<Self>, config: MaintenanceConfig) -> BackendResult<()> {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return Err(BackendError::Policy(
                "cache maintenance is already running".into(),
            ));
        }
        let handle =
            maintenance::start(Arc::clone(self), config, Arc::clone(&self.cache_running))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the cache-maintenance loop and join its thread
    pub fn stop_caching(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.stop();
        }
    }

    /// Whether the maintenance loop is running
    pub fn is_caching(&self) -> bool {
        self.cache_running.load(Ordering::Acquire)
    }

    /// Replace one backend's watermarks
    pub fn set_watermarks(&self, id: u8, watermarks: Watermarks) -> BackendResult<()> {
        self.backend(id)?.set_watermarks(watermarks)
    }

    /// Replace one backend's migration policy
    pub fn set_migration_policy(&self, id: u8, policy: MigrationPolicy) -> BackendResult<()> {
        self.backend(id)?.set_migration_policy(policy);
        Ok(())
    }

    // ---- introspection --------------------------------------------------

    /// List objects, optionally filtered to one backend
    pub fn list_objects(&self, backend_id: Option<u8>) -> Vec<ObjectInfo> {
        let mut rows = Vec::new();
        self.global.for_each(|entry| {
            if entry.is_deleted() {
                return;
            }
            if let Some(filter) = backend_id {
                if entry.backend_id() != filter {
                    return;
                }
            }
            rows.push(ObjectInfo {
                uri: entry.uri().to_string(),
                backend_id: entry.backend_id(),
                size: entry.size(),
                ephemeral: entry.is_ephemeral(),
                access_count: entry.access_count(),
                hotness: entry.hotness(),
            });
        });
        rows.sort_by(|a, b| a.uri.cmp(&b.uri));
        rows
    }

    /// Hotness of every live object, hottest first
    pub fn hotness_map(&self) -> Vec<HotnessSample> {
        let mut samples = Vec::new();
        self.global.for_each(|entry| {
            if entry.is_deleted() {
                return;
            }
            samples.push(HotnessSample {
                uri: entry.uri().to_string(),
                backend_id: entry.backend_id(),
                hotness: entry.hotness(),
                last_access_ms: entry.last_access_ms(),
            });
        });
        samples.sort_by(|a, b| {
            b.hotness
                .partial_cmp(&a.hotness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        samples
    }

    /// Full status snapshot
    pub fn status(&self) -> ManagerStatus {
        let roles = *self.roles.read();
        let backends: Vec<BackendStatus> = {
            let mut list: Vec<_> = self
                .backends
                .read()
                .values()
                .map(|b| b.status())
                .collect();
            list.sort_by_key(|s| s.id);
            list
        };
        let total_bytes = backends.iter().map(|b| b.used_bytes).sum();
        ManagerStatus {
            backends,
            default_backend: roles.default,
            ephemeral_backend: roles.ephemeral,
            cache_backend: roles.cache,
            cache_running: self.is_caching(),
            total_objects: self.global.len(),
            total_bytes,
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            objects_created: self.counters.objects_created.load(Ordering::Relaxed),
            objects_deleted: self.counters.objects_deleted.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            migrations: self.counters.migrations.load(Ordering::Relaxed),
            cache_promotions: self.counters.cache_promotions.load(Ordering::Relaxed),
            cache_evictions: self.counters.cache_evictions.load(Ordering::Relaxed),
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Persist every dirty per-backend index
    pub fn flush_indexes(&self) -> BackendResult<usize> {
        let mut saved = 0usize;
        let mut first_error = None;
        for backend in self.backends_snapshot() {
            match backend.index().save(backend.mount_path()) {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Flushing index of backend {} failed: {e}", backend.id());
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(saved),
        }
    }

    /// Orderly tear-down: stop maintenance, then flush dirty indexes
    pub fn shutdown(&self) -> BackendResult<()> {
        self.stop_caching();
        self.flush_indexes()?;
        Ok(())
    }
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackendManager {
    fn drop(&mut self) {
        self.stop_caching();
    }
}

fn validate_uri(uri: &str) -> BackendResult<()> {
    if uri.is_empty() || !uri.starts_with('/') {
        return Err(BackendError::InvalidConfig(format!(
            "URI '{uri}' must be absolute"
        )));
    }
    if uri.len() > MAX_URI_LEN {
        return Err(BackendError::InvalidConfig(format!(
            "URI length {} exceeds maximum {MAX_URI_LEN}",
            uri.len()
        )));
    }
    if uri.split('/').any(|part| part == "..") {
        return Err(BackendError::InvalidConfig(
            "URI must not contain parent references".into(),
        ));
    }
    Ok(())
}

/// Copy `len` bytes from a source descriptor into a destination file.
/// Kernel-to-kernel on Linux via `sendfile`; buffered elsewhere.
#[cfg(target_os = "linux")]
fn copy_fd_contents(
    src: std::os::fd::RawFd,
    dest: &std::fs::File,
    len: u64,
) -> BackendResult<u64> {
    use std::os::fd::BorrowedFd;

    let src_fd = unsafe { BorrowedFd::borrow_raw(src) };
    let mut offset: nix::libc::off_t = 0;
    let mut copied = 0u64;
    while copied < len {
        let chunk = (len - copied).min(1 << 30) as usize;
        let sent = nix::sys::sendfile::sendfile(dest, src_fd, Some(&mut offset), chunk)
            .map_err(|e| BackendError::Storage(format!("sendfile: {e}")))?;
        if sent == 0 {
            break;
        }
        copied += sent as u64;
    }
    Ok(copied)
}

#[cfg(not(target_os = "linux"))]
fn copy_fd_contents(
    src: std::os::fd::RawFd,
    dest: &std::fs::File,
    len: u64,
) -> BackendResult<u64> {
    use std::io::Write;
    use std::os::fd::BorrowedFd;

    let src_fd = unsafe { BorrowedFd::borrow_raw(src) };
    let mut dest = dest;
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    while copied < len {
        let chunk = (len - copied).min(buf.len() as u64) as usize;
        let read = nix::sys::uio::pread(src_fd, &mut buf[..chunk], copied as nix::libc::off_t)
            .map_err(|e| BackendError::Storage(format!("pread: {e}")))?;
        if read == 0 {
            break;
        }
        dest.write_all(&buf[..read])?;
        copied += read as u64;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::payload::{payload_caps, Encoding, VariantDescriptor};

    fn manager_with_two_tiers(dir: &std::path::Path) -> Arc<BackendManager> {
        let manager = Arc::new(BackendManager::new());
        manager
            .register_backend(BackendConfig::persistent(
                1,
                BackendType::Nvme,
                dir.join("nvme"),
                1 << 30,
            ))
            .unwrap();
        manager
            .register_backend(BackendConfig::persistent(
                2,
                BackendType::Hdd,
                dir.join("hdd"),
                1 << 30,
            ))
            .unwrap();
        manager
    }

    fn put(manager: &BackendManager, uri: &str, content: &[u8]) {
        let fd_ref = manager
            .create_object(CreateRequest {
                uri: uri.into(),
                backend_id: None,
                ephemeral: false,
            })
            .unwrap();
        nix::sys::uio::pwrite(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd_ref.raw_fd()) },
            content,
            0,
        )
        .unwrap();
        drop(fd_ref);
        manager.update_size(uri, content.len() as u64).unwrap();
    }

    fn read_all(fd_ref: &FdRef) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = 0i64;
        let mut buf = [0u8; 4096];
        loop {
            let n = nix::sys::uio::pread(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(fd_ref.raw_fd()) },
                &mut buf,
                offset,
            )
            .unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            offset += n as i64;
        }
        out
    }

    #[test]
    fn test_create_get_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());

        put(&manager, "/data/a.bin", b"payload bytes");
        let fd_ref = manager.get_object("/data/a.bin").unwrap();
        assert_eq!(read_all(&fd_ref), b"payload bytes");
        drop(fd_ref);

        let metadata = manager.get_metadata("/data/a.bin").unwrap();
        assert_eq!(metadata.size, 13);
        assert_eq!(metadata.backend_id, 1);
        assert!(metadata.payload.is_some());

        assert!(manager.delete_object("/data/a.bin").is_ok());
        assert!(matches!(
            manager.delete_object("/data/a.bin"),
            Err(BackendError::NotFound(_))
        ));
        assert!(manager.get_object("/data/a.bin").is_err());
    }

    #[test]
    fn test_used_bytes_tracks_entries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());

        put(&manager, "/a", &[0u8; 100]);
        put(&manager, "/b", &[0u8; 50]);
        let backend = manager.backend(1).unwrap();
        assert_eq!(backend.used_bytes(), 150);

        manager.delete_object("/a").unwrap();
        assert_eq!(backend.used_bytes(), 50);
    }

    #[test]
    fn test_migration_moves_bytes_and_preserves_identity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());

        put(&manager, "/move/me.bin", b"movable content");
        let before = manager.lookup("/move/me.bin").unwrap();

        manager.migrate_object("/move/me.bin", 2).unwrap();

        let after = manager.lookup("/move/me.bin").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.backend_id(), 2);
        assert_eq!(manager.backend(1).unwrap().used_bytes(), 0);
        assert_eq!(manager.backend(2).unwrap().used_bytes(), 15);

        let fd_ref = manager.get_object("/move/me.bin").unwrap();
        assert_eq!(read_all(&fd_ref), b"movable content");
    }

    #[test]
    fn test_migration_keeps_live_borrows_readable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());

        put(&manager, "/live.bin", b"stable view");
        let held = manager.get_object("/live.bin").unwrap();
        manager.migrate_object("/live.bin", 2).unwrap();

        // The pre-migration borrow still reads the original bytes through
        // the now-unlinked inode.
        assert_eq!(read_all(&held), b"stable view");
    }

    #[test]
    fn test_ephemeral_discipline() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());
        manager
            .register_backend(BackendConfig::ephemeral(0, dir.path().join("mem"), 1 << 20))
            .unwrap();
        manager.set_ephemeral_backend(0).unwrap();

        put(&manager, "/x", &[1u8; 64]);

        // Persistent object into the ephemeral-only backend: refused.
        assert!(matches!(
            manager.migrate_object("/x", 0),
            Err(BackendError::Policy(_))
        ));

        // Marking it ephemeral after the fact does not help: the data
        // already sits on persistent media.
        manager.lookup("/x").unwrap().set_ephemeral(true);
        assert!(matches!(
            manager.migrate_object("/x", 0),
            Err(BackendError::Policy(_))
        ));

        // Ephemeral-to-ephemeral migration works.
        manager
            .register_backend(BackendConfig::ephemeral(3, dir.path().join("mem2"), 1 << 20))
            .unwrap();
        let fd_ref = manager
            .create_object(CreateRequest {
                uri: "/y".into(),
                backend_id: Some(0),
                ephemeral: true,
            })
            .unwrap();
        drop(fd_ref);
        manager.migrate_object("/y", 3).unwrap();
        assert_eq!(manager.lookup("/y").unwrap().backend_id(), 3);
    }

    #[test]
    fn test_migrate_to_same_backend_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());
        put(&manager, "/same", b"x");
        assert!(matches!(
            manager.migrate_object("/same", 1),
            Err(BackendError::Migration(_))
        ));
    }

    #[test]
    fn test_payload_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());
        put(&manager, "/meta.bin", &[7u8; 32]);

        let descriptor = PayloadDescriptor {
            variants: vec![
                VariantDescriptor::identity(32),
                VariantDescriptor {
                    variant_id: 1,
                    encoding: Encoding::Zstd,
                    is_primary: false,
                    logical_length: 32,
                    storage_length: 20,
                    range_granularity: 0,
                    capabilities: payload_caps::ZSTD,
                },
            ],
        };
        manager
            .set_payload_metadata("/meta.bin", descriptor.clone())
            .unwrap();
        assert_eq!(
            manager.get_payload_metadata("/meta.bin").unwrap().unwrap(),
            descriptor
        );

        let invalid = PayloadDescriptor { variants: vec![] };
        assert!(manager.set_payload_metadata("/meta.bin", invalid).is_err());
    }

    #[test]
    fn test_zero_byte_object_has_no_payload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());
        put(&manager, "/empty", b"");
        let metadata = manager.get_metadata("/empty").unwrap();
        assert_eq!(metadata.size, 0);
        assert!(metadata.payload.is_none());
    }

    #[test]
    fn test_uri_validation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());
        for bad in ["", "relative", "/../escape", "/a/../../b"] {
            assert!(
                manager
                    .create_object(CreateRequest {
                        uri: bad.into(),
                        backend_id: None,
                        ephemeral: false,
                    })
                    .is_err(),
                "URI {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_concurrent_readers_during_migration() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_two_tiers(dir.path());
        let content = vec![0xAB; 256 * 1024];
        put(&manager, "/hot.bin", &content);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let expected = content.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let fd_ref = manager.get_object("/hot.bin").unwrap();
                        assert_eq!(read_all(&fd_ref), expected);
                    }
                })
            })
            .collect();

        let migrator = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager.migrate_object("/hot.bin", 2).unwrap();
            })
        };

        migrator.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(manager.lookup("/hot.bin").unwrap().backend_id(), 2);
    }
}
