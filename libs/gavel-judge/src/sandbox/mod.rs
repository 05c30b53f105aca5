//! Isolation Provider - the only code that touches processes or containers.
//!
//! **Contract:**
//! - `acquire` creates a fresh sandbox with a private scratch directory
//! - `run` executes one command inside it, always bounded by a timeout;
//!   on expiry the whole process tree is killed and `timed_out` is set
//! - `release` tears everything down; idempotent, never fails the caller
//!
//! Backends ([`ProcessProvider`], [`DockerProvider`]) are interchangeable:
//! the orchestrator only ever sees [`IsolationProvider`] through a
//! [`SandboxPool`].

pub mod capture;
pub mod docker;
pub mod pool;
pub mod process;
#[cfg(test)]
pub(crate) mod scripted;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gavel_common::{Config, SandboxBackend};
use tempfile::TempDir;
use thiserror::Error;
use tracing::warn;

pub use docker::DockerProvider;
pub use pool::{PoolSnapshot, SandboxLease, SandboxPool, Stage};
pub use process::ProcessProvider;

/// Whether sandboxed code may reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    Isolated,
    /// Only for local debugging; never used by the worker defaults.
    Host,
}

/// Resource ceilings applied to one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u64,
    /// Per-stream cap on captured stdout/stderr.
    pub max_output_bytes: usize,
    pub network: NetworkPolicy,
}

impl SandboxLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            memory_mb: config.sandbox_memory_mb,
            cpus: config.sandbox_cpus,
            pids: config.sandbox_pids_limit,
            max_output_bytes: config.max_output_bytes,
            network: if config.sandbox_isolate_network {
                NetworkPolicy::Isolated
            } else {
                NetworkPolicy::Host
            },
        }
    }

    /// Compilers fork helpers and use more memory than the programs they build.
    pub fn for_compilation(&self) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_mul(2),
            pids: self.pids.saturating_mul(4),
            ..self.clone()
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 1.0,
            pids: 64,
            max_output_bytes: 1024 * 1024,
            network: NetworkPolicy::Isolated,
        }
    }
}

/// Raw result of one sandboxed run. Exit status is data, not a verdict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed before reporting a status.
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no sandbox slot became free within {0:?}")]
    PoolExhausted(Duration),
    #[error("sandbox backend unavailable: {0}")]
    Backend(String),
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// An ephemeral isolation handle.
///
/// Owns a private scratch directory on the host; backends run commands with
/// that directory as the working directory (bind-mounted for containers).
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    limits: SandboxLimits,
    workdir: PathBuf,
    scratch: Mutex<Option<TempDir>>,
    container_id: Option<String>,
    released: AtomicBool,
}

impl Sandbox {
    pub(crate) fn new(id: String, limits: SandboxLimits, scratch: TempDir, container_id: Option<String>) -> Self {
        Self {
            id,
            limits,
            workdir: scratch.path().to_path_buf(),
            scratch: Mutex::new(Some(scratch)),
            container_id,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Host path of the sandbox's private directory.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns true exactly once; later calls see the sandbox as already gone.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Delete the scratch directory. Failures are logged, never returned.
    pub(crate) fn remove_scratch(&self) {
        let scratch = self.scratch.lock().ok().and_then(|mut slot| slot.take());
        if let Some(dir) = scratch {
            if let Err(e) = dir.close() {
                warn!(sandbox_id = %self.id, error = %e, "Failed to remove sandbox directory");
            }
        }
    }
}

/// Globally unique sandbox name: wall-clock millis plus a random suffix.
pub fn new_sandbox_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("gavel-{}-{}", millis, &suffix[..12])
}

/// Create the private host directory for a new sandbox under `work_root`.
pub(crate) fn create_scratch(work_root: &Path, id: &str) -> Result<TempDir, SandboxError> {
    std::fs::create_dir_all(work_root)?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{}-", id))
        .tempdir_in(work_root)?;
    Ok(dir)
}

/// Isolation backend trait.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a fresh sandbox. `image` names the toolchain for backends that
    /// need one; host backends ignore it.
    async fn acquire(&self, limits: &SandboxLimits, image: &str) -> Result<Sandbox, SandboxError>;

    /// Run `command` inside the sandbox, feeding `stdin` in full and then
    /// closing it. Never blocks past `timeout` plus teardown.
    async fn run(
        &self,
        sandbox: &Sandbox,
        command: &[String],
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError>;

    /// Tear down. Safe to call repeatedly and after the backing
    /// process/container has already died.
    async fn release(&self, sandbox: &Sandbox);
}

/// Build the backend named by `SANDBOX_BACKEND`.
pub fn provider_from_config(config: &Config) -> Result<Arc<dyn IsolationProvider>, SandboxError> {
    match config.sandbox_backend {
        SandboxBackend::Docker => Ok(Arc::new(DockerProvider::connect(&config.sandbox_work_root)?)),
        SandboxBackend::Process => Ok(Arc::new(ProcessProvider::new(&config.sandbox_work_root))),
    }
}
