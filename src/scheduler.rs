//! Scheduler and distributed lock
//!
//! Each enabled entity gets its own polling loop. Before every cycle the
//! loop takes a per-entity lock from the [`LockProvider`], so at most one
//! process runs a given entity's cycle at a time even when several
//! scheduler instances share the lock store. An unavailable lock is the
//! normal contention outcome and only logs at debug.
//!
//! ## Usage
//!
//! ```ignore
//! let scheduler = Scheduler::new(Arc::new(MemoryLockProvider::new()));
//! scheduler.add_entity(orchestrator);
//! scheduler.start();
//! // ...
//! scheduler.shutdown().await;
//! ```

use crate::config::EntityConfig;
use crate::error::{RelayError, Result};
use crate::orchestrator::{CancelToken, EntityOrchestrator};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Held lock. Releasing happens on drop and must not block, so providers
/// release synchronously or hand the release off to a background task.
pub trait LockGuard: Send {}

/// Per-entity mutual exclusion across scheduler instances.
#[async_trait::async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to take the named lock without waiting.
    ///
    /// `Err(RelayError::LockUnavailable)` means another holder; any other
    /// error is a provider failure.
    async fn try_acquire(&self, name: &str) -> Result<Box<dyn LockGuard>>;
}

pub type SharedLockProvider = Arc<dyn LockProvider>;

/// In-process lock provider backed by a mutex-guarded name set.
#[derive(Default)]
pub struct MemoryLockProvider {
    held: Arc<std::sync::Mutex<std::collections::HashSet<String>>>,
}

struct MemoryLockGuard {
    name: String,
    held: Arc<std::sync::Mutex<std::collections::HashSet<String>>>,
}

impl LockGuard for MemoryLockGuard {}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.name);
        }
    }
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the named lock is currently held. Test hook.
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .map(|h| h.contains(name))
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl LockProvider for MemoryLockProvider {
    async fn try_acquire(&self, name: &str) -> Result<Box<dyn LockGuard>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| RelayError::other("lock set poisoned"))?;
        if !held.insert(name.to_string()) {
            return Err(RelayError::LockUnavailable(name.to_string()));
        }
        Ok(Box::new(MemoryLockGuard {
            name: name.to_string(),
            held: self.held.clone(),
        }))
    }
}

/// Scheduler statistics across all entity loops.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub cycles_run: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub cycles_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStatsSnapshot {
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
        }
    }
}

struct EntityEntry {
    config: EntityConfig,
    orchestrator: Arc<EntityOrchestrator>,
}

/// Runs one polling loop per enabled entity, single-flight per entity via
/// the lock provider.
pub struct Scheduler {
    locks: SharedLockProvider,
    entities: Vec<EntityEntry>,
    stats: Arc<SchedulerStats>,
    cancel: CancelToken,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(locks: SharedLockProvider) -> Self {
        Self {
            locks,
            entities: Vec::new(),
            stats: Arc::new(SchedulerStats::default()),
            cancel: CancelToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register an entity loop driven by the orchestrator's own
    /// [`EntityConfig`]. No effect after [`start`](Self::start).
    pub fn add_entity(&mut self, orchestrator: EntityOrchestrator) {
        self.entities.push(EntityEntry {
            config: orchestrator.config().clone(),
            orchestrator: Arc::new(orchestrator),
        });
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn one loop per enabled entity.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        let mut handles = Vec::new();
        for entry in &self.entities {
            if !entry.config.enabled {
                debug!(entity = %entry.config.name, "entity disabled, no loop");
                continue;
            }
            handles.push(tokio::spawn(entity_loop(
                entry.config.clone(),
                entry.orchestrator.clone(),
                self.locks.clone(),
                self.stats.clone(),
                self.cancel.clone(),
                self.running.clone(),
                self.shutdown.clone(),
            )));
        }
        let count = handles.len();
        if let Ok(mut slot) = self.handles.lock() {
            *slot = handles;
        }
        info!(entities = count, "scheduler started");
    }

    /// Stop all loops and wait for in-flight cycles to reach a stage
    /// boundary.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.shutdown.notify_waiters();
        let handles = match self.handles.lock() {
            Ok(mut slot) => std::mem::take(&mut *slot),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

async fn entity_loop(
    config: EntityConfig,
    orchestrator: Arc<EntityOrchestrator>,
    locks: SharedLockProvider,
    stats: Arc<SchedulerStats>,
    cancel: CancelToken,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    info!(entity = %config.name, interval = ?config.poll_interval, "entity loop started");
    while running.load(Ordering::Relaxed) {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(config.poll_interval) => {
                run_guarded_cycle(&config, &orchestrator, &locks, &stats, &cancel).await;
            }
        }
    }
    info!(entity = %config.name, "entity loop stopped");
}

/// One tick: take the lock, run the cycle, release on drop.
async fn run_guarded_cycle(
    config: &EntityConfig,
    orchestrator: &EntityOrchestrator,
    locks: &SharedLockProvider,
    stats: &SchedulerStats,
    cancel: &CancelToken,
) {
    let _guard = match locks.try_acquire(&config.name).await {
        Ok(guard) => guard,
        Err(e) if e.is_skip() => {
            // Another instance owns this entity right now.
            debug!(entity = %config.name, "lock held elsewhere, skipping tick");
            stats.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Err(e) => {
            warn!(entity = %config.name, error = %e, "lock provider failed");
            stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let result = match config.cycle_timeout {
        Some(limit) => match tokio::time::timeout(limit, orchestrator.execute(cancel)).await {
            Ok(result) => result,
            Err(_) => {
                // A timed-out cycle is a normal failure: nothing was
                // completed, the next tick re-fetches.
                warn!(entity = %config.name, limit = ?limit, "cycle timed out");
                stats.cycles_run.fetch_add(1, Ordering::Relaxed);
                stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
        None => orchestrator.execute(cancel).await,
    };

    stats.cycles_run.fetch_add(1, Ordering::Relaxed);
    if let Some(e) = &result.error {
        stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
        warn!(entity = %config.name, error = %e, "cycle failed");
    }
}

/// Run one guarded cycle immediately, outside any loop. Useful for
/// on-demand ticks and tests.
pub async fn run_once(orchestrator: &EntityOrchestrator, locks: &SharedLockProvider) -> Result<()> {
    let stats = SchedulerStats::default();
    run_guarded_cycle(
        orchestrator.config(),
        orchestrator,
        locks,
        &stats,
        &CancelToken::new(),
    )
    .await;
    Ok(())
}
