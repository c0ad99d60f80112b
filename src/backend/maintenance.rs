//! The cache-maintenance background loop.
//!
//! One thread wakes at a fixed interval, samples every entry's decaying
//! hotness, and steers the cache backend between its watermarks: above
//! the high watermark it evicts the coldest cached objects until the
//! cache drops below the low watermark; below the low watermark it
//! promotes hot objects off the persistent tiers until the cache sits at
//! the midpoint. Ephemeral backends are never promotion sources and
//! ephemeral entries never move. Errors are logged and never propagate
//! out of the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};

use crate::backend::manager::BackendManager;
use crate::backend::{Backend, MigrationPolicy};

/// Tuning for the maintenance loop
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Tick interval
    pub interval: Duration,

    /// Hotness decay halflife in seconds
    pub halflife_secs: f64,

    /// Minimum hotness for promotion into the cache
    pub cache_threshold: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            halflife_secs: 3600.0,
            cache_threshold: 0.5,
        }
    }
}

/// Running maintenance thread; dropping without [`stop`](Self::stop)
/// detaches the thread until the stop channel disconnects
pub struct MaintenanceHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the loop to exit and join the thread
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            log::error!("Maintenance thread panicked");
        }
    }
}

/// Spawn the maintenance thread (manager-internal; use
/// `BackendManager::start_caching`)
pub(crate) fn start(
    manager: Arc<BackendManager>,
    config: MaintenanceConfig,
    running: Arc<AtomicBool>,
) -> std::io::Result<MaintenanceHandle> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    running.store(true, Ordering::Release);
    let thread_running = Arc::clone(&running);

    let thread = std::thread::Builder::new()
        .name("objmapper-maint".into())
        .spawn(move || {
            log::info!(
                "Cache maintenance running, interval {:?}, threshold {}",
                config.interval,
                config.cache_threshold
            );
            loop {
                match stop_rx.recv_timeout(config.interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => tick(&manager, &config),
                }
            }
            thread_running.store(false, Ordering::Release);
            log::info!("Cache maintenance stopped");
        });

    match thread {
        Ok(thread) => Ok(MaintenanceHandle { stop_tx, thread }),
        Err(e) => {
            running.store(false, Ordering::Release);
            Err(e)
        }
    }
}

/// One maintenance pass: sample hotness, then rebalance the cache
pub(crate) fn tick(manager: &BackendManager, config: &MaintenanceConfig) {
    for entry in manager.global().snapshot() {
        if !entry.is_deleted() {
            entry.sample_hotness(config.halflife_secs);
        }
    }

    let Some(cache) = manager.cache_backend() else {
        return;
    };
    let watermarks = cache.watermarks();
    let utilization = cache.utilization();

    if utilization > watermarks.high {
        evict_pass(manager, &cache, watermarks.low);
    } else if utilization < watermarks.low {
        let target = (watermarks.high + watermarks.low) / 2.0;
        promote_pass(manager, &cache, config.cache_threshold, target);
    }
}

/// Evict the coldest cached objects until utilisation drops below `low`.
/// Ordering: ascending hotness, ties broken by oldest access first.
fn evict_pass(manager: &BackendManager, cache: &Arc<Backend>, low: f64) {
    let mut candidates: Vec<_> = cache
        .index()
        .snapshot()
        .into_iter()
        .filter(|e| !e.is_deleted() && !e.is_ephemeral())
        .collect();
    candidates.sort_by(|a, b| {
        a.hotness()
            .partial_cmp(&b.hotness())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.last_access_ms().cmp(&b.last_access_ms()))
    });

    for entry in candidates {
        if cache.utilization() <= low {
            break;
        }
        let uri = entry.uri().to_string();
        match manager.evict_object(&uri) {
            Ok(()) => log::debug!("Evicted {uri} (hotness {:.3})", entry.hotness()),
            Err(e) => log::warn!("Evicting {uri} failed: {e}"),
        }
    }
}

/// Promote hot persistent objects into the cache until it reaches
/// `target` utilisation or candidates run out
fn promote_pass(manager: &BackendManager, cache: &Arc<Backend>, threshold: f64, target: f64) {
    let mut candidates = Vec::new();
    for backend in manager.backends_snapshot() {
        if backend.id() == cache.id()
            || backend.is_ephemeral_only()
            || !backend.is_enabled()
            || backend.migration_policy() != MigrationPolicy::Automatic
        {
            continue;
        }
        for entry in backend.index().snapshot() {
            if entry.is_deleted() || entry.is_ephemeral() {
                continue;
            }
            if entry.hotness() > threshold {
                candidates.push(entry);
            }
        }
    }
    // Hottest first.
    candidates.sort_by(|a, b| {
        b.hotness()
            .partial_cmp(&a.hotness())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for entry in candidates {
        if cache.utilization() >= target {
            break;
        }
        let uri = entry.uri().to_string();
        match manager.cache_object(&uri) {
            Ok(()) => log::debug!("Cached {uri} (hotness {:.3})", entry.hotness()),
            Err(e) => log::debug!("Caching {uri} skipped: {e}"),
        }
    }
}
