//! # Object Indexes
//!
//! The index layer owns the entry graph shared by every other subsystem:
//! - [`GlobalIndex`]: the process-wide URI → entry map (lock-free reads)
//! - [`BackendIndex`]: the same entries scoped to one backend, with
//!   dirty tracking and load/save persistence
//! - [`IndexEntry`] / [`FdRef`]: shared entries and borrowed descriptor
//!   handles
//! - [`payload`]: variant descriptors and their packed form

use thiserror::Error;

pub mod backend_index;
pub mod entry;
pub mod global;
pub mod payload;

pub use backend_index::{BackendIndex, INDEX_FILE_NAME};
pub use entry::{EntryRecord, FdRef, IndexEntry};
pub use global::GlobalIndex;
pub use payload::{PayloadDescriptor, VariantDescriptor};

/// Index errors
#[derive(Error, Debug)]
pub enum IndexError {
    /// URI is not indexed (or the entry was deleted)
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Backing storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index persistence failed
    #[error("Index persistence error: {0}")]
    Persist(String),

    /// Payload descriptor failed validation
    #[error(transparent)]
    Payload(#[from] payload::PayloadError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for index operations
pub type IndexResult<T> = std::result::Result<T, IndexError>;
