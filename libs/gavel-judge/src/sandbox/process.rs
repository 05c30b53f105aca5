//! Host process backend.
//!
//! Each sandbox is a private temp directory; each run is a fresh process
//! group with a scrubbed environment and kernel rlimits applied between fork
//! and exec. Network isolation goes through `unshare --user --net`, which
//! needs no privileges and leaves the program unprivileged in its own
//! user namespace; hosts that forbid user namespaces are detected once and
//! refuse to hand out isolated sandboxes.
//!
//! The process group is killed when the run ends (timeout or leader exit),
//! always while the leader is still an unreaped zombie, so the group id can
//! not have been recycled yet.
//!
//! Suited to development and trusted CI hosts; production uses Docker.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, instrument, warn};

use super::capture::{drain_into, CappedBuffer};
use super::{
    create_scratch, new_sandbox_id, ExecutionOutcome, IsolationProvider, NetworkPolicy, Sandbox, SandboxError,
    SandboxLimits,
};

const FILE_SIZE_LIMIT: u64 = 64 * 1024 * 1024;
const NAMESPACE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    data_bytes: u64,
    processes: u64,
    cpu_secs: u64,
}

impl RlimitPlan {
    fn new(limits: &SandboxLimits, timeout: Duration) -> Self {
        Self {
            data_bytes: limits.memory_bytes(),
            processes: limits.pids,
            // CPU time can never legitimately exceed wall time.
            cpu_secs: timeout.as_secs() + 1,
        }
    }

    /// Runs in the forked child before exec; only async-signal-safe calls.
    /// Requests above the inherited hard limit are lowered to it, since
    /// raising a hard limit needs CAP_SYS_RESOURCE.
    fn apply(&self) -> std::io::Result<()> {
        macro_rules! set_limit {
            ($resource:expr, $value:expr) => {{
                let mut current = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if unsafe { libc::getrlimit($resource, &mut current) } != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let value = clamp_to_hard($value as libc::rlim_t, current.rlim_max);
                let lim = libc::rlimit {
                    rlim_cur: value,
                    rlim_max: value,
                };
                if unsafe { libc::setrlimit($resource, &lim) } != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }};
        }

        set_limit!(libc::RLIMIT_DATA, self.data_bytes);
        set_limit!(libc::RLIMIT_NPROC, self.processes);
        set_limit!(libc::RLIMIT_CPU, self.cpu_secs);
        set_limit!(libc::RLIMIT_FSIZE, FILE_SIZE_LIMIT);
        set_limit!(libc::RLIMIT_CORE, 0);
        Ok(())
    }
}

fn clamp_to_hard(requested: libc::rlim_t, hard: libc::rlim_t) -> libc::rlim_t {
    // RLIM_INFINITY is the largest value, so min() covers it.
    requested.min(hard)
}

fn kill_group(pgid: i32) {
    // ESRCH only means the group is already gone.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Block until child `pid` has exited, without reaping it.
fn wait_exited(pid: i32) -> std::io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, libc::WEXITED | libc::WNOWAIT) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// SIGKILLs a run's process group at most once, and only while the group
/// leader is known to be unreaped. Dropping an armed guard (cancelled run)
/// fires it.
struct GroupKill {
    pgid: Option<i32>,
}

impl GroupKill {
    fn fire(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.fire();
    }
}

#[derive(Debug, Clone)]
pub struct ProcessProvider {
    work_root: PathBuf,
    search_path: String,
    unshare: PathBuf,
    /// Whether `unshare --user --net` works on this host; checked once.
    namespaces: Arc<OnceCell<Result<(), String>>>,
}

impl ProcessProvider {
    pub fn new(work_root: &Path) -> Self {
        Self {
            work_root: work_root.to_path_buf(),
            search_path: std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
            unshare: PathBuf::from("unshare"),
            namespaces: Arc::new(OnceCell::new()),
        }
    }

    #[cfg(test)]
    fn with_unshare(mut self, path: impl Into<PathBuf>) -> Self {
        self.unshare = path.into();
        self
    }

    /// Network isolation failing inside a run would look like the program
    /// crashing, so it is verified before any isolated sandbox is handed out.
    async fn ensure_namespaces(&self) -> Result<(), SandboxError> {
        let verdict = self
            .namespaces
            .get_or_init(|| async {
                let verdict = check_namespaces(&self.unshare, &self.search_path).await;
                match &verdict {
                    Ok(()) => debug!("User and network namespaces available"),
                    Err(reason) => error!(%reason, "Network isolation unavailable on this host"),
                }
                verdict
            })
            .await;
        verdict
            .clone()
            .map_err(|reason| SandboxError::Backend(format!("network isolation unavailable: {}", reason)))
    }

    fn build_command(&self, sandbox: &Sandbox, command: &[String], plan: RlimitPlan) -> Result<Command, SandboxError> {
        let mut argv: Vec<&str> = Vec::with_capacity(command.len() + 3);
        if sandbox.limits().network == NetworkPolicy::Isolated {
            argv.push(self.unshare.to_str().unwrap_or("unshare"));
            argv.push("--user");
            argv.push("--net");
        }
        argv.extend(command.iter().map(String::as_str));

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Backend("empty command".to_string()))?;

        let workdir = sandbox.workdir();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", &self.search_path)
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        unsafe {
            cmd.pre_exec(move || plan.apply());
        }

        Ok(cmd)
    }
}

async fn check_namespaces(unshare: &Path, search_path: &str) -> Result<(), String> {
    let probe = Command::new(unshare)
        .args(["--user", "--net", "true"])
        .env_clear()
        .env("PATH", search_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(NAMESPACE_CHECK_TIMEOUT, probe).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} exited with {}: {}", unshare.display(), output.status, stderr.trim()))
        }
        Ok(Err(e)) => Err(format!("failed to start {}: {}", unshare.display(), e)),
        Err(_) => Err(format!("{} did not finish within {:?}", unshare.display(), NAMESPACE_CHECK_TIMEOUT)),
    }
}

#[async_trait]
impl IsolationProvider for ProcessProvider {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn acquire(&self, limits: &SandboxLimits, _image: &str) -> Result<Sandbox, SandboxError> {
        if limits.network == NetworkPolicy::Isolated {
            self.ensure_namespaces().await?;
        }
        let id = new_sandbox_id();
        let scratch = create_scratch(&self.work_root, &id)?;
        debug!(sandbox_id = %id, dir = %scratch.path().display(), "Created process sandbox");
        Ok(Sandbox::new(id, limits.clone(), scratch, None))
    }

    #[instrument(skip(self, sandbox, stdin), fields(sandbox_id = sandbox.id(), timeout_ms = timeout.as_millis() as u64))]
    async fn run(
        &self,
        sandbox: &Sandbox,
        command: &[String],
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        if sandbox.is_released() {
            return Err(SandboxError::Backend(format!("sandbox {} already released", sandbox.id())));
        }

        let plan = RlimitPlan::new(sandbox.limits(), timeout);
        let mut cmd = self.build_command(sandbox, command, plan)?;

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        let pid = child.id().map(|pid| pid as i32);
        // process_group(0): the group id is the leader's pid.
        let mut group = GroupKill { pgid: pid };

        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        let limit = sandbox.limits().max_output_bytes;
        let mut stdout = CappedBuffer::new(limit);
        let mut stderr = CappedBuffer::new(limit);

        let feed = async move {
            if let Some(mut pipe) = child_stdin {
                // Programs that never read stdin close the pipe on exit.
                if let Err(e) = pipe.write_all(stdin).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        debug!(error = %e, "Failed to write stdin");
                    }
                }
                let _ = pipe.shutdown().await;
            }
        };

        let leader = async {
            if let Some(pid) = pid {
                match tokio::task::spawn_blocking(move || wait_exited(pid)).await {
                    // Zombie leader: the group id is still ours. Background
                    // children die here so they cannot hold the pipes open.
                    Ok(Ok(())) => group.fire(),
                    Ok(Err(e)) => {
                        debug!(error = %e, "Could not observe leader exit");
                        group.disarm();
                    }
                    Err(e) => {
                        debug!(error = %e, "Leader wait task failed");
                        group.disarm();
                    }
                }
            }
            child.wait().await
        };

        let collect = async {
            let (_, out, err, status) = tokio::join!(
                feed,
                drain_into(child_stdout, &mut stdout),
                drain_into(child_stderr, &mut stderr),
                leader,
            );
            if let Err(e) = out.and(err) {
                debug!(error = %e, "Output pipe error");
            }
            status
        };

        let raced = tokio::time::timeout(timeout, collect).await;
        let (exit_code, timed_out) = match raced {
            Ok(Ok(status)) => (status.code().or_else(|| status.signal().map(|s| 128 + s)), false),
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_) => {
                group.fire();
                let _ = child.kill().await;
                (None, true)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(?exit_code, timed_out, elapsed_ms, "Process run finished");

        Ok(ExecutionOutcome {
            stdout: stdout.to_string_lossy(),
            stderr: stderr.to_string_lossy(),
            exit_code,
            elapsed_ms,
            timed_out,
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
        })
    }

    async fn release(&self, sandbox: &Sandbox) {
        if !sandbox.mark_released() {
            return;
        }
        sandbox.remove_scratch();
        if sandbox.workdir().exists() {
            warn!(sandbox_id = sandbox.id(), "Sandbox directory survived release");
        }
    }
}
