//! The global URI index.
//!
//! URI → entry resolution is the hot path of every request, so the map is
//! a sharded concurrent hash map: readers never take a whole-map lock and
//! never block each other. Entries are handed out as `Arc` clones — the
//! Rust rendition of the acquire/release reference counting the indexes
//! are specified with.

use std::sync::Arc;

use dashmap::DashMap;

use crate::index::entry::IndexEntry;

/// URI → entry map shared by every session and the maintenance loop
pub struct GlobalIndex {
    entries: DashMap<String, Arc<IndexEntry>>,
}

impl GlobalIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Look up an entry, taking a shared reference
    pub fn get(&self, uri: &str) -> Option<Arc<IndexEntry>> {
        self.entries.get(uri).map(|e| Arc::clone(e.value()))
    }

    /// Insert an entry, returning any entry the URI previously mapped to.
    /// A URI appears at most once; replacement is the caller's decision.
    pub fn insert(&self, entry: Arc<IndexEntry>) -> Option<Arc<IndexEntry>> {
        self.entries.insert(entry.uri().to_string(), entry)
    }

    /// Remove an entry by URI
    pub fn remove(&self, uri: &str) -> Option<Arc<IndexEntry>> {
        self.entries.remove(uri).map(|(_, e)| e)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are indexed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit every entry without holding a whole-map lock
    pub fn for_each<F: FnMut(&Arc<IndexEntry>)>(&self, mut f: F) {
        for item in self.entries.iter() {
            f(item.value());
        }
    }

    /// Snapshot all entries (maintenance and status paths)
    pub fn snapshot(&self) -> Vec<Arc<IndexEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

impl Default for GlobalIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uri: &str) -> Arc<IndexEntry> {
        Arc::new(IndexEntry::new(
            uri.into(),
            0,
            format!("/tmp{uri}").into(),
            1,
            0,
            false,
        ))
    }

    #[test]
    fn test_uri_maps_to_single_entry() {
        let index = GlobalIndex::new();
        assert!(index.insert(entry("/a")).is_none());
        let replaced = index.insert(entry("/a"));
        assert!(replaced.is_some());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_shared_reference_survives_removal() {
        let index = GlobalIndex::new();
        index.insert(entry("/a"));
        let held = index.get("/a").unwrap();
        index.remove("/a");
        assert!(index.get("/a").is_none());
        // The held reference is still valid.
        assert_eq!(held.uri(), "/a");
    }

    #[test]
    fn test_concurrent_readers() {
        let index = Arc::new(GlobalIndex::new());
        for i in 0..64 {
            index.insert(entry(&format!("/obj{i}")));
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..64 {
                        assert!(index.get(&format!("/obj{i}")).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
