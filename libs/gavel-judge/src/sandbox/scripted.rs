//! In-memory isolation backend for tests.
//!
//! Sandboxes get real scratch directories so file-level isolation can be
//! observed, but "running" a command just calls a script closure.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use super::capture::CappedBuffer;
use super::{create_scratch, new_sandbox_id, ExecutionOutcome, IsolationProvider, Sandbox, SandboxError, SandboxLimits};

#[derive(Debug, Clone, Default)]
pub(crate) struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub delay: Duration,
    pub hang: bool,
}

impl Reply {
    pub fn stdout(s: impl Into<String>) -> Self {
        Self {
            stdout: s.into(),
            ..Default::default()
        }
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Script = dyn Fn(&[String], &str, &Path) -> Reply + Send + Sync;

pub(crate) struct ScriptedProvider {
    root: TempDir,
    script: Arc<Script>,
    fail_acquire: bool,
    acquire_delay: Duration,
    acquired: AtomicUsize,
    released: AtomicUsize,
    commands: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    /// Echo provider: stdout is stdin, exit 0.
    pub fn new() -> Self {
        Self::with_script(|_, stdin, _| Reply::stdout(stdin))
    }

    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&[String], &str, &Path) -> Reply + Send + Sync + 'static,
    {
        Self {
            root: tempfile::tempdir().expect("scratch root"),
            script: Arc::new(script),
            fail_acquire: false,
            acquire_delay: Duration::ZERO,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_acquire(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    /// Sandbox creation takes `delay`, like a cold image pull.
    pub fn slow_acquire(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    /// Scratch directories still on disk.
    pub fn leftover_dirs(&self) -> usize {
        std::fs::read_dir(self.root.path()).map(|d| d.count()).unwrap_or(0)
    }
}

#[async_trait]
impl IsolationProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn acquire(&self, limits: &SandboxLimits, _image: &str) -> Result<Sandbox, SandboxError> {
        tokio::time::sleep(self.acquire_delay).await;
        if self.fail_acquire {
            return Err(SandboxError::Backend("scripted backend refuses to allocate".to_string()));
        }
        let id = new_sandbox_id();
        let scratch = create_scratch(self.root.path(), &id)?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Sandbox::new(id, limits.clone(), scratch, None))
    }

    async fn run(
        &self,
        sandbox: &Sandbox,
        command: &[String],
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.commands.lock().unwrap().push(command.to_vec());
        let started = Instant::now();
        let input = String::from_utf8_lossy(stdin).into_owned();
        let reply = (self.script)(command, &input, sandbox.workdir());

        if reply.hang || reply.delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Ok(ExecutionOutcome {
                elapsed_ms: started.elapsed().as_millis() as u64,
                timed_out: true,
                ..Default::default()
            });
        }
        tokio::time::sleep(reply.delay).await;

        let limit = sandbox.limits().max_output_bytes;
        let mut stdout = CappedBuffer::new(limit);
        stdout.push(reply.stdout.as_bytes());
        let mut stderr = CappedBuffer::new(limit);
        stderr.push(reply.stderr.as_bytes());

        Ok(ExecutionOutcome {
            stdout: stdout.to_string_lossy(),
            stderr: stderr.to_string_lossy(),
            exit_code: Some(reply.exit_code),
            elapsed_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
        })
    }

    async fn release(&self, sandbox: &Sandbox) {
        if sandbox.mark_released() {
            self.released.fetch_add(1, Ordering::SeqCst);
            sandbox.remove_scratch();
        }
    }
}
