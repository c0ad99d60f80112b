//! # Storage Backends
//!
//! A backend is one storage tier: a mount point with a capacity, flag
//! set, watermarks, a migration policy, a performance factor, and its own
//! scoped index. The [`manager`](crate::backend::manager) owns the
//! registry and every object operation; [`maintenance`] runs the
//! promotion/eviction loop; [`scan`] rebuilds indexes from the
//! filesystem.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::{BackendIndex, IndexError};

pub mod maintenance;
pub mod manager;
pub mod scan;

pub use maintenance::{MaintenanceConfig, MaintenanceHandle};
pub use manager::{BackendManager, CreateRequest, ObjectInfo, ObjectMetadata};

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    /// URI not present in the global index
    #[error("Object not found: {0}")]
    NotFound(String),

    /// No backend registered under this id
    #[error("Backend {0} is not registered")]
    BackendNotFound(u8),

    /// Backend id already registered
    #[error("Backend {0} is already registered")]
    DuplicateBackend(u8),

    /// Backend or request configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation refused by flags or the ephemeral/persistent discipline
    #[error("Policy violation: {0}")]
    Policy(String),

    /// Migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Backing storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index error
    #[error(transparent)]
    Index(#[from] IndexError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Storage tier class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// tmpfs-class memory storage
    Memory,
    /// NVMe flash
    Nvme,
    /// SATA/SAS flash
    Ssd,
    /// Rotational storage
    Hdd,
    /// Remote storage
    Network,
}

impl BackendType {
    /// Default performance factor of the tier, higher is faster
    pub fn default_perf_factor(self) -> f64 {
        match self {
            BackendType::Memory => 100.0,
            BackendType::Nvme => 25.0,
            BackendType::Ssd => 10.0,
            BackendType::Hdd => 2.0,
            BackendType::Network => 1.0,
        }
    }
}

/// Backend flag bits
pub mod backend_flags {
    /// Backend accepts operations
    pub const ENABLED: u32 = 0x01;
    /// Backend only ever holds ephemeral objects
    pub const EPHEMERAL_ONLY: u32 = 0x02;
    /// Backend survives restarts
    pub const PERSISTENT: u32 = 0x04;
    /// Objects may migrate off this backend
    pub const MIGRATION_SRC: u32 = 0x08;
    /// Objects may migrate onto this backend
    pub const MIGRATION_DST: u32 = 0x10;
    /// No writes accepted
    pub const READONLY: u32 = 0x20;
}

/// Utilisation thresholds steering cache maintenance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Eviction starts above this utilisation
    pub high: f64,

    /// Eviction stops (and promotion may start) below this utilisation
    pub low: f64,
}

impl Watermarks {
    /// Validate `0 ≤ low < high ≤ 1`
    pub fn validate(&self) -> BackendResult<()> {
        if !(0.0..=1.0).contains(&self.low)
            || !(0.0..=1.0).contains(&self.high)
            || self.low >= self.high
        {
            return Err(BackendError::InvalidConfig(format!(
                "watermarks low={} high={} must satisfy 0 <= low < high <= 1",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high: 0.85,
            low: 0.6,
        }
    }
}

/// Per-backend migration participation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPolicy {
    /// No migrations at all, explicit calls included
    Disabled,
    /// Only explicit `migrate_object` calls
    Manual,
    /// Maintenance may promote objects off this backend
    Automatic,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        MigrationPolicy::Automatic
    }
}

/// Mutable per-backend policy state, behind one reader-writer lock
#[derive(Debug, Clone)]
pub struct BackendPolicy {
    /// Flag bits, see [`backend_flags`]
    pub flags: u32,

    /// Cache watermarks
    pub watermarks: Watermarks,

    /// Migration participation
    pub migration_policy: MigrationPolicy,
}

/// Per-backend operation counters
#[derive(Debug, Default)]
pub struct BackendStats {
    /// Object reads served
    pub reads: AtomicU64,
    /// Object writes
    pub writes: AtomicU64,
    /// Objects migrated onto this backend
    pub migrations_in: AtomicU64,
    /// Objects migrated off this backend
    pub migrations_out: AtomicU64,
}

/// Registration parameters for one backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend id, unique in the registry
    pub id: u8,

    /// Storage tier class
    pub backend_type: BackendType,

    /// Root directory for object files
    pub mount_path: PathBuf,

    /// Capacity in bytes
    pub capacity: u64,

    /// Initial flag bits
    pub flags: u32,

    /// Cache watermarks
    pub watermarks: Watermarks,

    /// Migration participation
    pub migration_policy: MigrationPolicy,

    /// Performance factor override; `None` uses the tier default
    pub perf_factor: Option<f64>,
}

impl BackendConfig {
    /// A persistent, migration-capable backend rooted at `mount_path`
    pub fn persistent(id: u8, backend_type: BackendType, mount_path: PathBuf, capacity: u64) -> Self {
        Self {
            id,
            backend_type,
            mount_path,
            capacity,
            flags: backend_flags::ENABLED
                | backend_flags::PERSISTENT
                | backend_flags::MIGRATION_SRC
                | backend_flags::MIGRATION_DST,
            watermarks: Watermarks::default(),
            migration_policy: MigrationPolicy::default(),
            perf_factor: None,
        }
    }

    /// A memory-tier cache backend rooted at `mount_path`
    pub fn cache(id: u8, mount_path: PathBuf, capacity: u64) -> Self {
        Self {
            id,
            backend_type: BackendType::Memory,
            mount_path,
            capacity,
            flags: backend_flags::ENABLED | backend_flags::MIGRATION_SRC | backend_flags::MIGRATION_DST,
            watermarks: Watermarks::default(),
            migration_policy: MigrationPolicy::default(),
            perf_factor: None,
        }
    }

    /// An ephemeral-only memory backend rooted at `mount_path`
    pub fn ephemeral(id: u8, mount_path: PathBuf, capacity: u64) -> Self {
        Self {
            id,
            backend_type: BackendType::Memory,
            mount_path,
            capacity,
            flags: backend_flags::ENABLED
                | backend_flags::EPHEMERAL_ONLY
                | backend_flags::MIGRATION_SRC
                | backend_flags::MIGRATION_DST,
            watermarks: Watermarks::default(),
            migration_policy: MigrationPolicy::default(),
            perf_factor: None,
        }
    }
}

/// One registered storage tier
pub struct Backend {
    id: u8,
    backend_type: BackendType,
    mount_path: PathBuf,
    capacity: u64,
    used: AtomicU64,
    policy: RwLock<BackendPolicy>,
    perf_factor: f64,
    index: BackendIndex,
    stats: BackendStats,
}

impl Backend {
    /// Build a backend from its registration config (manager-internal)
    pub(crate) fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: config.id,
            backend_type: config.backend_type,
            mount_path: config.mount_path.clone(),
            capacity: config.capacity,
            used: AtomicU64::new(0),
            policy: RwLock::new(BackendPolicy {
                flags: config.flags,
                watermarks: config.watermarks,
                migration_policy: config.migration_policy,
            }),
            perf_factor: config
                .perf_factor
                .unwrap_or_else(|| config.backend_type.default_perf_factor()),
            index: BackendIndex::new(),
            stats: BackendStats::default(),
        }
    }

    /// Backend id
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Storage tier class
    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Mount root
    pub fn mount_path(&self) -> &PathBuf {
        &self.mount_path
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently attributed to this backend
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Utilisation in [0, 1]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / self.capacity as f64
    }

    /// Performance factor
    pub fn perf_factor(&self) -> f64 {
        self.perf_factor
    }

    /// The backend-scoped index
    pub fn index(&self) -> &BackendIndex {
        &self.index
    }

    /// Operation counters
    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }

    /// Current flag bits
    pub fn flags(&self) -> u32 {
        self.policy.read().flags
    }

    /// Current watermarks
    pub fn watermarks(&self) -> Watermarks {
        self.policy.read().watermarks
    }

    /// Current migration policy
    pub fn migration_policy(&self) -> MigrationPolicy {
        self.policy.read().migration_policy
    }

    /// Replace the watermarks after validation
    pub fn set_watermarks(&self, watermarks: Watermarks) -> BackendResult<()> {
        watermarks.validate()?;
        self.policy.write().watermarks = watermarks;
        Ok(())
    }

    /// Replace the migration policy
    pub fn set_migration_policy(&self, policy: MigrationPolicy) {
        self.policy.write().migration_policy = policy;
    }

    /// True when the flag bit is set
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    /// Backend accepts operations
    pub fn is_enabled(&self) -> bool {
        self.has_flag(backend_flags::ENABLED)
    }

    /// Backend refuses writes
    pub fn is_readonly(&self) -> bool {
        self.has_flag(backend_flags::READONLY)
    }

    /// Backend only holds ephemeral objects
    pub fn is_ephemeral_only(&self) -> bool {
        self.has_flag(backend_flags::EPHEMERAL_ONLY)
    }

    /// Account bytes onto this backend
    pub(crate) fn add_used(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Account bytes off this backend
    pub(crate) fn sub_used(&self, bytes: u64) {
        // Saturating: a scan racing a delete must not wrap the counter.
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Serialisable status snapshot of one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    /// Backend id
    pub id: u8,
    /// Storage tier class
    pub backend_type: BackendType,
    /// Mount root
    pub mount_path: PathBuf,
    /// Capacity in bytes
    pub capacity: u64,
    /// Bytes in use
    pub used_bytes: u64,
    /// Utilisation in [0, 1]
    pub utilization: f64,
    /// Objects indexed on this backend
    pub object_count: usize,
    /// Flag bits
    pub flags: u32,
    /// Watermarks
    pub watermarks: Watermarks,
    /// Migration policy
    pub migration_policy: MigrationPolicy,
    /// Reads served
    pub reads: u64,
    /// Writes served
    pub writes: u64,
    /// Migrations onto this backend
    pub migrations_in: u64,
    /// Migrations off this backend
    pub migrations_out: u64,
}

impl Backend {
    /// Snapshot for the status surface
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            id: self.id,
            backend_type: self.backend_type,
            mount_path: self.mount_path.clone(),
            capacity: self.capacity,
            used_bytes: self.used_bytes(),
            utilization: self.utilization(),
            object_count: self.index.len(),
            flags: self.flags(),
            watermarks: self.watermarks(),
            migration_policy: self.migration_policy(),
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            migrations_in: self.stats.migrations_in.load(Ordering::Relaxed),
            migrations_out: self.stats.migrations_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_validation() {
        assert!(Watermarks { high: 0.8, low: 0.5 }.validate().is_ok());
        assert!(Watermarks { high: 0.5, low: 0.5 }.validate().is_err());
        assert!(Watermarks { high: 0.4, low: 0.5 }.validate().is_err());
        assert!(Watermarks { high: 1.2, low: 0.5 }.validate().is_err());
    }

    #[test]
    fn test_used_accounting_saturates() {
        let backend = Backend::from_config(&BackendConfig::persistent(
            1,
            BackendType::Ssd,
            "/tmp/b".into(),
            1000,
        ));
        backend.add_used(100);
        backend.sub_used(250);
        assert_eq!(backend.used_bytes(), 0);
    }

    #[test]
    fn test_utilization() {
        let backend = Backend::from_config(&BackendConfig::cache(0, "/tmp/c".into(), 1000));
        backend.add_used(850);
        assert!((backend.utilization() - 0.85).abs() < 1e-9);
        assert!(!backend.is_ephemeral_only());
    }
}
