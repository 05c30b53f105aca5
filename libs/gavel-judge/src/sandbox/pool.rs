//! System-wide sandbox capacity.
//!
//! One pool per process, shared by every submission, so a large test suite
//! queues behind its own slots instead of starving other jobs. The semaphore
//! and the atomic counters are the only mutable state shared between
//! concurrent sandbox runs.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gavel_common::Config;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{ExecutionOutcome, IsolationProvider, Sandbox, SandboxError, SandboxLimits};

/// Upper bound on backend sandbox creation, image pulls included.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Which pipeline stage asked for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Execute,
}

#[derive(Debug, Default)]
struct PoolStats {
    compilations: AtomicU64,
    executions: AtomicU64,
    acquire_failures: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub compilations: u64,
    pub executions: u64,
    pub acquire_failures: u64,
    pub active: usize,
    pub peak: usize,
}

#[derive(Clone)]
pub struct SandboxPool {
    provider: Arc<dyn IsolationProvider>,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    create_timeout: Duration,
    stats: Arc<PoolStats>,
}

impl SandboxPool {
    pub fn new(provider: Arc<dyn IsolationProvider>, capacity: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            provider,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn from_config(provider: Arc<dyn IsolationProvider>, config: &Config) -> Self {
        Self::new(
            provider,
            config.max_concurrent_sandboxes,
            Duration::from_millis(config.sandbox_acquire_timeout_ms),
        )
        .with_create_timeout(Duration::from_millis(config.sandbox_create_timeout_ms))
    }

    /// Number of sandboxes that may be alive at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            capacity: self.capacity,
            compilations: self.stats.compilations.load(Ordering::Relaxed),
            executions: self.stats.executions.load(Ordering::Relaxed),
            acquire_failures: self.stats.acquire_failures.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Acquire),
            peak: self.stats.peak.load(Ordering::Acquire),
        }
    }

    /// Wait for a slot, then create a sandbox in it.
    pub async fn acquire(&self, stage: Stage, limits: &SandboxLimits, image: &str) -> Result<SandboxLease, SandboxError> {
        match stage {
            Stage::Compile => self.stats.compilations.fetch_add(1, Ordering::Relaxed),
            Stage::Execute => self.stats.executions.fetch_add(1, Ordering::Relaxed),
        };

        let permit = match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                self.stats.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(SandboxError::Backend("sandbox pool is closed".to_string()));
            }
            Err(_elapsed) => {
                self.stats.acquire_failures.fetch_add(1, Ordering::Relaxed);
                warn!(?stage, timeout_ms = self.acquire_timeout.as_millis() as u64, "Sandbox pool exhausted");
                return Err(SandboxError::PoolExhausted(self.acquire_timeout));
            }
        };

        let slot = Slot::occupy(permit, self.stats.clone());
        let created = tokio::time::timeout(self.create_timeout, self.provider.acquire(limits, image))
            .await
            .unwrap_or_else(|_elapsed| {
                Err(SandboxError::Backend(format!(
                    "sandbox creation did not finish within {:?}",
                    self.create_timeout
                )))
            });
        let sandbox = match created {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.stats.acquire_failures.fetch_add(1, Ordering::Relaxed);
                warn!(?stage, backend = self.provider.name(), error = %e, "Sandbox acquisition failed");
                return Err(e);
            }
        };

        debug!(sandbox_id = sandbox.id(), ?stage, backend = self.provider.name(), "Sandbox acquired");

        Ok(SandboxLease {
            sandbox: Arc::new(sandbox),
            provider: self.provider.clone(),
            slot: Some(slot),
            released: false,
        })
    }
}

/// An occupied unit of pool capacity; frees itself on drop.
struct Slot {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
}

impl Slot {
    fn occupy(permit: OwnedSemaphorePermit, stats: Arc<PoolStats>) -> Self {
        let active = stats.active.fetch_add(1, Ordering::AcqRel) + 1;
        stats.peak.fetch_max(active, Ordering::AcqRel);
        Self { _permit: permit, stats }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A sandbox checked out of the pool.
///
/// Call [`SandboxLease::release`] on every path. If the lease is dropped
/// instead (panic, cancelled task), teardown is spawned on the current
/// runtime and the pool slot is held until it finishes.
pub struct SandboxLease {
    sandbox: Arc<Sandbox>,
    provider: Arc<dyn IsolationProvider>,
    slot: Option<Slot>,
    released: bool,
}

impl SandboxLease {
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub async fn run(&self, command: &[String], stdin: &[u8], timeout: Duration) -> Result<ExecutionOutcome, SandboxError> {
        self.provider.run(&self.sandbox, command, stdin, timeout).await
    }

    pub async fn release(mut self) {
        self.provider.release(&self.sandbox).await;
        self.released = true;
        self.slot.take();
        debug!(sandbox_id = self.sandbox.id(), "Sandbox released");
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let sandbox = self.sandbox.clone();
        let provider = self.provider.clone();
        let slot = self.slot.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(sandbox_id = sandbox.id(), "Sandbox lease dropped without release; tearing down in background");
                handle.spawn(async move {
                    provider.release(&sandbox).await;
                    drop(slot);
                });
            }
            Err(_) => {
                // Scratch directory still goes away with the Sandbox itself.
                warn!(sandbox_id = sandbox.id(), "Sandbox lease dropped outside a runtime; backend teardown skipped");
            }
        }
    }
}
