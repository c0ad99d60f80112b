//! Filesystem scanning: rebuild indexes from a backend's mount.
//!
//! Scanning walks the mount recursively and creates entries for regular
//! files the indexes do not yet track. The entry URI is the path relative
//! to the mount root; flags default to persistent unless the backend is
//! ephemeral-only. A restart therefore recovers state even when the
//! persisted index file is missing or stale.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::backend::manager::BackendManager;
use crate::backend::BackendResult;
use crate::index::{IndexEntry, INDEX_FILE_NAME};

impl BackendManager {
    /// Walk one backend's mount and index every untracked regular file.
    /// Returns the number of entries created.
    pub fn scan_backend(&self, id: u8) -> BackendResult<usize> {
        let backend = self.backend(id)?;
        let mount = backend.mount_path().clone();
        let ephemeral = backend.is_ephemeral_only();
        let mut created = 0usize;
        let mut stack = vec![mount.clone()];

        while let Some(dir) = stack.pop() {
            let reader = match std::fs::read_dir(&dir) {
                Ok(reader) => reader,
                Err(e) => {
                    log::warn!("Scan cannot read {}: {e}", dir.display());
                    continue;
                }
            };
            for item in reader {
                let item = match item {
                    Ok(item) => item,
                    Err(e) => {
                        log::warn!("Scan skipping unreadable entry in {}: {e}", dir.display());
                        continue;
                    }
                };
                let path = item.path();
                let file_type = match item.file_type() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                if item
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(INDEX_FILE_NAME))
                {
                    // Index persistence artifacts are not objects.
                    continue;
                }

                let Ok(rel) = path.strip_prefix(&mount) else {
                    continue;
                };
                let Some(rel_str) = rel.to_str() else {
                    log::warn!("Scan skipping non-UTF-8 path {}", path.display());
                    continue;
                };
                let uri = format!("/{rel_str}");
                if self.global().get(&uri).is_some() {
                    continue;
                }

                let metadata = match item.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        log::warn!("Scan cannot stat {}: {e}", path.display());
                        continue;
                    }
                };
                let size = metadata.len();
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);

                let entry = Arc::new(IndexEntry::new(uri, id, path, size, mtime, ephemeral));
                self.global().insert(Arc::clone(&entry));
                backend.index().insert(entry);
                backend.add_used(size);
                created += 1;
            }
        }

        if created > 0 {
            log::info!("Scan of backend {id} indexed {created} objects");
        }
        Ok(created)
    }

    /// Scan every registered backend
    pub fn scan_all(&self) -> BackendResult<usize> {
        let mut total = 0usize;
        let mut ids: Vec<u8> = self.backends_snapshot().iter().map(|b| b.id()).collect();
        ids.sort_unstable();
        for id in ids {
            total += self.scan_backend(id)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::manager::BackendManager;
    use crate::backend::{BackendConfig, BackendType};
    use std::sync::Arc;

    #[test]
    fn test_scan_indexes_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("store");
        std::fs::create_dir_all(mount.join("data/subdir")).unwrap();
        std::fs::write(mount.join("top.bin"), b"top").unwrap();
        std::fs::write(mount.join("data/subdir/file.bin"), b"nested bytes").unwrap();

        let manager = Arc::new(BackendManager::new());
        manager
            .register_backend(BackendConfig::persistent(
                1,
                BackendType::Hdd,
                mount.clone(),
                1 << 20,
            ))
            .unwrap();

        let created = manager.scan_backend(1).unwrap();
        assert_eq!(created, 2);

        let entry = manager.lookup("/data/subdir/file.bin").unwrap();
        assert_eq!(entry.size(), 12);
        assert!(!entry.is_ephemeral());
        assert_eq!(manager.backend(1).unwrap().used_bytes(), 15);

        // Second scan finds nothing new.
        assert_eq!(manager.scan_backend(1).unwrap(), 0);
    }

    #[test]
    fn test_scan_skips_index_file() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("store");
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::write(mount.join(".objmapper.idx"), b"not an object").unwrap();
        std::fs::write(mount.join("real.bin"), b"object").unwrap();

        let manager = Arc::new(BackendManager::new());
        manager
            .register_backend(BackendConfig::persistent(
                1,
                BackendType::Hdd,
                mount,
                1 << 20,
            ))
            .unwrap();

        // Registration ignores the bogus index file (bad magic) and the
        // scan must not index it either.
        assert_eq!(manager.scan_backend(1).unwrap(), 1);
        assert!(manager.lookup("/real.bin").is_ok());
        assert!(manager.lookup("/.objmapper.idx").is_err());
    }

    #[test]
    fn test_scan_marks_ephemeral_on_ephemeral_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mem");
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::write(mount.join("scratch"), b"tmp").unwrap();

        let manager = Arc::new(BackendManager::new());
        manager
            .register_backend(BackendConfig::ephemeral(0, mount, 1 << 20))
            .unwrap();

        manager.scan_backend(0).unwrap();
        assert!(manager.lookup("/scratch").unwrap().is_ephemeral());
    }
}
