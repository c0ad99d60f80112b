//! Per-backend indexes with load/save persistence.
//!
//! Each backend scopes the same shared entries to its own mount. Any
//! mutation marks the index dirty; a dirty index is persisted at shutdown
//! (or explicit flush) as `<mount>/.objmapper.idx` — a version-tagged
//! header followed by a run of entry records, written to a temp file and
//! atomically renamed into place. A restart loads the file instead of
//! rescanning the mount; a header mismatch falls back to a scan.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::index::entry::{EntryRecord, IndexEntry};
use crate::index::{IndexError, IndexResult};

/// On-disk index file name, relative to the backend mount
pub const INDEX_FILE_NAME: &str = ".objmapper.idx";

/// Index file magic
const INDEX_MAGIC: &[u8; 4] = b"OMIX";

/// Index file format version
const INDEX_FORMAT_VERSION: u32 = 1;

/// URI → entry map scoped to one backend
pub struct BackendIndex {
    entries: DashMap<String, Arc<IndexEntry>>,
    dirty: AtomicBool,
}

impl BackendIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Look up an entry on this backend
    pub fn get(&self, uri: &str) -> Option<Arc<IndexEntry>> {
        self.entries.get(uri).map(|e| Arc::clone(e.value()))
    }

    /// Insert an entry, marking the index dirty
    pub fn insert(&self, entry: Arc<IndexEntry>) {
        self.entries.insert(entry.uri().to_string(), entry);
        self.dirty.store(true, Ordering::Release);
    }

    /// Remove an entry, marking the index dirty when one existed
    pub fn remove(&self, uri: &str) -> Option<Arc<IndexEntry>> {
        let removed = self.entries.remove(uri).map(|(_, e)| e);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// True when the URI is indexed on this backend
    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    /// Number of entries on this backend
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are indexed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot all entries on this backend
    pub fn snapshot(&self) -> Vec<Arc<IndexEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Mark the index dirty (entry-level mutations that bypass
    /// insert/remove, e.g. payload updates)
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// True when there are unpersisted mutations
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Reset the dirty flag after rebuilding from persisted records
    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Persist the index under `mount` if dirty. Write-temp-then-rename so
    /// a crash never leaves a torn file.
    pub fn save(&self, mount: &Path) -> IndexResult<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let records: Vec<EntryRecord> = self
            .entries
            .iter()
            .map(|e| e.value().to_record())
            .collect();

        let final_path = mount.join(INDEX_FILE_NAME);
        let temp_path = mount.join(format!("{INDEX_FILE_NAME}.tmp"));
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(INDEX_MAGIC)?;
            writer.write_all(&INDEX_FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&(records.len() as u32).to_le_bytes())?;
            writer.write_all(&[0u8; 4])?;
            for record in &records {
                bincode::serialize_into(&mut writer, record)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&temp_path, &final_path)?;
        self.dirty.store(false, Ordering::Release);
        log::debug!(
            "Saved {} index records to {}",
            records.len(),
            final_path.display()
        );
        Ok(true)
    }

    /// Load persisted records from `mount`. Returns `None` when there is
    /// no index file or its header does not match — callers fall back to
    /// scanning the mount.
    pub fn load_records(mount: &Path) -> IndexResult<Option<Vec<EntryRecord>>> {
        let path = mount.join(INDEX_FILE_NAME);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 16];
        if let Err(e) = reader.read_exact(&mut header) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                log::warn!("Index file {} is truncated, ignoring", path.display());
                return Ok(None);
            }
            return Err(e.into());
        }
        if &header[0..4] != INDEX_MAGIC {
            log::warn!("Index file {} has bad magic, ignoring", path.display());
            return Ok(None);
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != INDEX_FORMAT_VERSION {
            log::warn!(
                "Index file {} has format version {version}, expected {INDEX_FORMAT_VERSION}; ignoring",
                path.display()
            );
            return Ok(None);
        }
        let count = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(bincode::deserialize_from(&mut reader)?);
        }
        log::debug!("Loaded {count} index records from {}", path.display());
        Ok(Some(records))
    }
}

impl Default for BackendIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Path of the persisted index file for a given mount
pub fn index_file_path(mount: &Path) -> PathBuf {
    mount.join(INDEX_FILE_NAME)
}

// IndexError needs the bincode conversion only here.
impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Persist(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::payload::PayloadDescriptor;

    fn entry(uri: &str, size: u64) -> Arc<IndexEntry> {
        Arc::new(IndexEntry::new(
            uri.into(),
            1,
            format!("/mnt{uri}").into(),
            size,
            1_700_000_000,
            false,
        ))
    }

    #[test]
    fn test_dirty_tracking() {
        let index = BackendIndex::new();
        assert!(!index.is_dirty());
        index.insert(entry("/a", 1));
        assert!(index.is_dirty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = BackendIndex::new();

        let first = entry("/data/a.bin", 100);
        first.set_payload(PayloadDescriptor::identity_only(100));
        first.record_access();
        index.insert(first);
        index.insert(entry("/data/b.bin", 200));

        assert!(index.save(dir.path()).unwrap());
        assert!(!index.is_dirty());
        // Second save is a no-op while clean.
        assert!(!index.save(dir.path()).unwrap());

        let records = BackendIndex::load_records(dir.path()).unwrap().unwrap();
        assert_eq!(records.len(), 2);
        let a = records.iter().find(|r| r.uri == "/data/a.bin").unwrap();
        assert_eq!(a.size, 100);
        assert_eq!(a.access_count, 1);
        assert!(a.payload.is_some());
    }

    #[test]
    fn test_missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BackendIndex::load_records(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let index = BackendIndex::new();
        index.insert(entry("/x", 1));
        index.save(dir.path()).unwrap();

        // Corrupt the format version in place.
        let path = index_file_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] = 0xEE;
        std::fs::write(&path, bytes).unwrap();

        assert!(BackendIndex::load_records(dir.path()).unwrap().is_none());
    }
}
