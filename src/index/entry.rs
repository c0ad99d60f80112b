//! Index entries and borrowed descriptor handles.
//!
//! One [`IndexEntry`] represents one stored object. The same
//! atomically-reference-counted entry is shared by the global index, the
//! owning backend's index, and every live [`FdRef`]; there are no back
//! pointers. The entry owns the (lazily opened) backing descriptor;
//! [`FdRef`] borrows shared ownership of it, so a concurrent migration or
//! delete never invalidates a reader — the old descriptor stays open and
//! keeps reading the old inode until the last borrow drops.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::index::payload::PayloadDescriptor;
use crate::index::{IndexError, IndexResult};

/// Entry flag bits
pub mod entry_flags {
    /// Data must never reach persistent media
    pub const EPHEMERAL: u32 = 0x01;
    /// Data survives restarts
    pub const PERSISTENT: u32 = 0x02;
}

/// Milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One stored object, shared across indexes and borrows
pub struct IndexEntry {
    /// Object URI, unique in the global index
    uri: String,

    /// Backend currently holding the bytes
    backend_id: AtomicU32,

    /// Backend the object was created or scanned on; eviction returns here
    home_backend_id: AtomicU32,

    /// Filesystem path of the backing file
    backend_path: RwLock<PathBuf>,

    /// Object size in bytes
    size: AtomicU64,

    /// Modification time, seconds since the epoch
    mtime: AtomicU64,

    /// Flag bits, see [`entry_flags`]
    flags: AtomicU32,

    /// Total accesses since creation
    access_count: AtomicU64,

    /// Decaying hotness score in [0, 1], stored as f64 bits
    hotness: AtomicU64,

    /// Last access, milliseconds since the epoch
    last_access_ms: AtomicU64,

    /// Last hotness sample, milliseconds since the epoch
    last_sample_ms: AtomicU64,

    /// Set by accesses, consumed as the recency pulse by sampling
    accessed_since_sample: AtomicBool,

    /// Variant descriptor, if one was published
    payload: RwLock<Option<PayloadDescriptor>>,

    /// Lazily opened backing descriptor, shared with live borrows
    fd: Mutex<Option<Arc<OwnedFd>>>,

    /// Live borrow count, statistics only; lifetime is carried by the Arcs
    fd_refcount: AtomicU32,

    /// Bumped whenever migration repoints the backing file
    fd_generation: AtomicU64,

    /// Logically deleted; the entry lingers until the last borrow drops
    deleted: AtomicBool,
}

impl IndexEntry {
    /// Create an entry for a freshly created or scanned object
    pub fn new(
        uri: String,
        backend_id: u8,
        backend_path: PathBuf,
        size: u64,
        mtime: u64,
        ephemeral: bool,
    ) -> Self {
        let flags = if ephemeral {
            entry_flags::EPHEMERAL
        } else {
            entry_flags::PERSISTENT
        };
        let now = unix_millis();
        Self {
            uri,
            backend_id: AtomicU32::new(u32::from(backend_id)),
            home_backend_id: AtomicU32::new(u32::from(backend_id)),
            backend_path: RwLock::new(backend_path),
            size: AtomicU64::new(size),
            mtime: AtomicU64::new(mtime),
            flags: AtomicU32::new(flags),
            access_count: AtomicU64::new(0),
            hotness: AtomicU64::new(0f64.to_bits()),
            last_access_ms: AtomicU64::new(now),
            last_sample_ms: AtomicU64::new(now),
            accessed_since_sample: AtomicBool::new(false),
            payload: RwLock::new(None),
            fd: Mutex::new(None),
            fd_refcount: AtomicU32::new(0),
            fd_generation: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    /// Object URI
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Backend currently holding the bytes
    pub fn backend_id(&self) -> u8 {
        self.backend_id.load(Ordering::Acquire) as u8
    }

    /// Backend the object was created on
    pub fn home_backend_id(&self) -> u8 {
        self.home_backend_id.load(Ordering::Acquire) as u8
    }

    /// Current backing path
    pub fn backend_path(&self) -> PathBuf {
        self.backend_path.read().clone()
    }

    /// Object size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Modification time, seconds since the epoch
    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::Acquire)
    }

    /// Update the modification time
    pub fn touch_mtime(&self, mtime: u64) {
        self.mtime.store(mtime, Ordering::Release);
    }

    /// True when the entry carries the ephemeral flag
    pub fn is_ephemeral(&self) -> bool {
        self.flags.load(Ordering::Acquire) & entry_flags::EPHEMERAL != 0
    }

    /// Flip the ephemeral/persistent discipline of this entry
    pub fn set_ephemeral(&self, ephemeral: bool) {
        let flags = if ephemeral {
            entry_flags::EPHEMERAL
        } else {
            entry_flags::PERSISTENT
        };
        self.flags.store(flags, Ordering::Release);
    }

    /// Total accesses since creation
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Current hotness score in [0, 1]
    pub fn hotness(&self) -> f64 {
        f64::from_bits(self.hotness.load(Ordering::Relaxed))
    }

    /// Last access, milliseconds since the epoch
    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// True once the entry was logically deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Live borrow count
    pub fn fd_refcount(&self) -> u32 {
        self.fd_refcount.load(Ordering::Relaxed)
    }

    /// Record one access: bump the counter, refresh the access time, and
    /// arm the recency pulse for the next hotness sample
    pub fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms.store(unix_millis(), Ordering::Relaxed);
        self.accessed_since_sample.store(true, Ordering::Release);
    }

    /// Apply one hotness sample:
    /// `new = 0.7 · exp(-Δt / halflife) · old + 0.3 · pulse`
    /// where the pulse is 1.0 when the entry was accessed since the last
    /// sample. Returns the updated score.
    pub fn sample_hotness(&self, halflife_secs: f64) -> f64 {
        let now = unix_millis();
        let last = self.last_sample_ms.swap(now, Ordering::AcqRel);
        let dt_secs = now.saturating_sub(last) as f64 / 1000.0;
        let pulse = if self.accessed_since_sample.swap(false, Ordering::AcqRel) {
            1.0
        } else {
            0.0
        };
        let old = self.hotness();
        let decayed = 0.7 * (-dt_secs / halflife_secs).exp() * old + 0.3 * pulse;
        let clamped = decayed.clamp(0.0, 1.0);
        self.hotness.store(clamped.to_bits(), Ordering::Relaxed);
        clamped
    }

    /// Update the size, returning the previous value so the backend can
    /// adjust its `used_bytes`
    pub fn set_size(&self, size: u64) -> u64 {
        self.size.swap(size, Ordering::AcqRel)
    }

    /// Published payload descriptor, if any
    pub fn payload(&self) -> Option<PayloadDescriptor> {
        self.payload.read().clone()
    }

    /// Replace the payload descriptor (caller validates first)
    pub fn set_payload(&self, descriptor: PayloadDescriptor) {
        *self.payload.write() = Some(descriptor);
    }

    /// Seed an identity-only descriptor when none exists and the size is
    /// non-zero, so every non-empty object has a deliverable variant
    pub fn seed_identity_payload(&self) {
        let size = self.size();
        if size == 0 {
            return;
        }
        let mut guard = self.payload.write();
        if guard.is_none() {
            *guard = Some(PayloadDescriptor::identity_only(size));
        }
    }

    /// Borrow the backing descriptor, opening it on first use
    pub fn acquire_fd(self: &Arc<Self>) -> IndexResult<FdRef> {
        if self.is_deleted() {
            return Err(IndexError::NotFound(self.uri.clone()));
        }
        let mut slot = self.fd.lock();
        let shared = match slot.as_ref() {
            Some(shared) => Arc::clone(shared),
            None => {
                let path = self.backend_path.read().clone();
                let file = OpenOptions::new().read(true).open(&path).map_err(|e| {
                    IndexError::Storage(format!("open {}: {e}", path.display()))
                })?;
                let shared = Arc::new(OwnedFd::from(file));
                *slot = Some(Arc::clone(&shared));
                shared
            }
        };
        drop(slot);
        self.fd_refcount.fetch_add(1, Ordering::AcqRel);
        Ok(FdRef {
            entry: Arc::clone(self),
            fd: shared,
            generation: self.fd_generation.load(Ordering::Acquire),
        })
    }

    /// Stash a freshly created descriptor on the entry so the first
    /// borrow reuses it instead of reopening the path
    pub fn install_fd(&self, fd: Arc<OwnedFd>) {
        *self.fd.lock() = Some(fd);
    }

    /// Repoint the entry at a migrated file. Outstanding borrows keep the
    /// previous descriptor; new borrows open the new path.
    pub fn repoint(&self, backend_id: u8, path: PathBuf) {
        *self.backend_path.write() = path;
        self.backend_id
            .store(u32::from(backend_id), Ordering::Release);
        *self.fd.lock() = None;
        self.fd_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Current descriptor generation
    pub fn fd_generation(&self) -> u64 {
        self.fd_generation.load(Ordering::Acquire)
    }

    /// Mark deleted and release the entry's own descriptor hold. Borrowed
    /// descriptors stay open until their `FdRef`s drop.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        *self.fd.lock() = None;
    }

    /// Snapshot for index persistence
    pub fn to_record(&self) -> EntryRecord {
        EntryRecord {
            uri: self.uri.clone(),
            backend_id: self.backend_id(),
            home_backend_id: self.home_backend_id(),
            path: self.backend_path(),
            size: self.size(),
            flags: self.flags.load(Ordering::Acquire),
            mtime: self.mtime(),
            access_count: self.access_count(),
            hotness: self.hotness(),
            payload: self.payload(),
        }
    }

    /// Rebuild an entry from a persisted record
    pub fn from_record(record: EntryRecord) -> Self {
        let now = unix_millis();
        Self {
            uri: record.uri,
            backend_id: AtomicU32::new(u32::from(record.backend_id)),
            home_backend_id: AtomicU32::new(u32::from(record.home_backend_id)),
            backend_path: RwLock::new(record.path),
            size: AtomicU64::new(record.size),
            mtime: AtomicU64::new(record.mtime),
            flags: AtomicU32::new(record.flags),
            access_count: AtomicU64::new(record.access_count),
            hotness: AtomicU64::new(record.hotness.to_bits()),
            last_access_ms: AtomicU64::new(now),
            last_sample_ms: AtomicU64::new(now),
            accessed_since_sample: AtomicBool::new(false),
            payload: RwLock::new(record.payload),
            fd: Mutex::new(None),
            fd_refcount: AtomicU32::new(0),
            fd_generation: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for IndexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEntry")
            .field("uri", &self.uri)
            .field("backend_id", &self.backend_id())
            .field("size", &self.size())
            .field("hotness", &self.hotness())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// Borrowed handle to an entry's open descriptor
pub struct FdRef {
    entry: Arc<IndexEntry>,
    fd: Arc<OwnedFd>,
    generation: u64,
}

impl FdRef {
    /// Raw descriptor for read/sendfile/sendmsg calls
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The entry this borrow belongs to
    pub fn entry(&self) -> &Arc<IndexEntry> {
        &self.entry
    }

    /// Generation at borrow time; differs from the entry's current
    /// generation once a migration repointed the backing file
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for FdRef {
    fn drop(&mut self) {
        self.entry.fd_refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Persisted form of one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Object URI
    pub uri: String,
    /// Backend holding the bytes
    pub backend_id: u8,
    /// Backend the object was created on
    pub home_backend_id: u8,
    /// Backing file path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Flag bits
    pub flags: u32,
    /// Modification time, seconds
    pub mtime: u64,
    /// Total accesses
    pub access_count: u64,
    /// Hotness at save time
    pub hotness: f64,
    /// Payload descriptor, if published
    pub payload: Option<PayloadDescriptor>,
}

/// Resolve the backing path of an entry created under `mount` for `uri`
pub fn backing_path(mount: &Path, uri: &str) -> PathBuf {
    mount.join(uri.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_entry(dir: &Path, content: &[u8]) -> Arc<IndexEntry> {
        let path = dir.join("obj.bin");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        Arc::new(IndexEntry::new(
            "/obj.bin".into(),
            1,
            path,
            content.len() as u64,
            0,
            false,
        ))
    }

    #[test]
    fn test_acquire_shares_one_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let entry = scratch_entry(dir.path(), b"shared");

        let a = entry.acquire_fd().unwrap();
        let b = entry.acquire_fd().unwrap();
        assert_eq!(a.raw_fd(), b.raw_fd());
        assert_eq!(entry.fd_refcount(), 2);

        drop(a);
        assert_eq!(entry.fd_refcount(), 1);
        drop(b);
        assert_eq!(entry.fd_refcount(), 0);
    }

    #[test]
    fn test_borrow_survives_delete() {
        let dir = tempfile::tempdir().unwrap();
        let entry = scratch_entry(dir.path(), b"keep reading");

        let borrow = entry.acquire_fd().unwrap();
        entry.mark_deleted();
        assert!(entry.acquire_fd().is_err());

        // The borrowed descriptor still reads the old bytes.
        let mut buf = vec![0u8; 12];
        let n = nix::sys::uio::pread(&*borrow.fd, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"keep reading");
    }

    #[test]
    fn test_repoint_bumps_generation_and_keeps_old_borrows() {
        let dir = tempfile::tempdir().unwrap();
        let entry = scratch_entry(dir.path(), b"old");

        let borrow = entry.acquire_fd().unwrap();
        let new_path = dir.path().join("new.bin");
        std::fs::write(&new_path, b"new").unwrap();
        entry.repoint(2, new_path.clone());

        assert_eq!(entry.backend_id(), 2);
        assert_eq!(entry.backend_path(), new_path);
        assert_eq!(borrow.generation() + 1, entry.fd_generation());

        let fresh = entry.acquire_fd().unwrap();
        assert_ne!(borrow.raw_fd(), fresh.raw_fd());
    }

    #[test]
    fn test_hotness_decays_without_access() {
        let dir = tempfile::tempdir().unwrap();
        let entry = scratch_entry(dir.path(), b"x");

        entry.record_access();
        let first = entry.sample_hotness(3600.0);
        assert!(first > 0.0 && first <= 1.0);

        // No access between samples: the score can only shrink.
        let second = entry.sample_hotness(3600.0);
        assert!(second < first);
        let third = entry.sample_hotness(3600.0);
        assert!(third < second);
    }

    #[test]
    fn test_seed_identity_payload_skips_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entry = scratch_entry(dir.path(), b"");
        entry.seed_identity_payload();
        assert!(entry.payload().is_none());

        entry.set_size(10);
        entry.seed_identity_payload();
        let descriptor = entry.payload().unwrap();
        assert_eq!(descriptor.primary().unwrap().logical_length, 10);
    }

    #[test]
    fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entry = scratch_entry(dir.path(), b"abcdef");
        entry.record_access();
        entry.seed_identity_payload();

        let record = entry.to_record();
        let rebuilt = IndexEntry::from_record(record);
        assert_eq!(rebuilt.uri(), entry.uri());
        assert_eq!(rebuilt.size(), entry.size());
        assert_eq!(rebuilt.access_count(), 1);
        assert!(rebuilt.payload().is_some());
    }
}
