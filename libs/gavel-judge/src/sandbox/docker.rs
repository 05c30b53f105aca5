//! Container backend built on the Docker Engine API.
//!
//! One long-lived container per sandbox (`sleep infinity` under tini), with
//! the sandbox's scratch directory bind-mounted at `/sandbox`. Each `run` is a
//! `docker exec` into that container, so compile output written by one
//! command is visible to the next. The container has no network, no
//! capabilities, a read-only root filesystem and runs as `nobody`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::capture::CappedBuffer;
use super::{create_scratch, new_sandbox_id, ExecutionOutcome, IsolationProvider, Sandbox, SandboxError, SandboxLimits};

const CONTAINER_WORKDIR: &str = "/sandbox";
const SANDBOX_USER: &str = "65534:65534";

/// How long to wait for the daemon to report an exec's exit code after its
/// output streams have closed.
const EXIT_CODE_POLL: Duration = Duration::from_millis(20);
const EXIT_CODE_ATTEMPTS: usize = 50;

pub struct DockerProvider {
    docker: Docker,
    work_root: PathBuf,
    pulled: Mutex<HashSet<String>>,
}

impl DockerProvider {
    /// Connect to the local daemon (`DOCKER_HOST` or the default socket).
    ///
    /// `work_root` must be a path the daemon can bind-mount, i.e. on the same
    /// host as dockerd.
    pub fn connect(work_root: &Path) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            work_root: work_root.to_path_buf(),
            pulled: Mutex::new(HashSet::new()),
        })
    }

    /// Make sure `image` exists locally, pulling it if needed.
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.pulled.lock().map(|seen| seen.contains(image)).unwrap_or(false) {
            return Ok(());
        }

        if self.docker.inspect_image(image).await.is_err() {
            info!(image, "Pulling toolchain image");
            let options = Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            });
            let mut stream = self.docker.create_image(options, None, None);
            while let Some(progress) = stream.next().await {
                progress?;
            }
            info!(image, "Image pulled");
        }

        if let Ok(mut seen) = self.pulled.lock() {
            seen.insert(image.to_string());
        }
        Ok(())
    }

    fn container_config(image: &str, workdir: &Path, limits: &SandboxLimits) -> Config<String> {
        let memory = i64::try_from(limits.memory_bytes()).unwrap_or(i64::MAX);
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,nosuid,size=64m".to_string());

        Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            env: Some(vec!["HOME=/tmp".to_string(), "LANG=C.UTF-8".to_string()]),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((limits.cpus * 1_000_000_000.0) as i64),
                pids_limit: Some(i64::try_from(limits.pids).unwrap_or(i64::MAX)),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                binds: Some(vec![format!("{}:{}", workdir.display(), CONTAINER_WORKDIR)]),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                init: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn exit_code(&self, exec_id: &str) -> Option<i32> {
        for _ in 0..EXIT_CODE_ATTEMPTS {
            match self.docker.inspect_exec(exec_id).await {
                Ok(info) if info.running != Some(true) => {
                    return info.exit_code.and_then(|code| i32::try_from(code).ok());
                }
                Ok(_) => tokio::time::sleep(EXIT_CODE_POLL).await,
                Err(e) => {
                    warn!(exec_id, error = %e, "Failed to inspect exec");
                    return None;
                }
            }
        }
        None
    }
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(e, DockerError::DockerResponseServerError { status_code: 404, .. })
}

#[cfg(unix)]
fn open_for_container_user(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
}

#[cfg(not(unix))]
fn open_for_container_user(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl IsolationProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn acquire(&self, limits: &SandboxLimits, image: &str) -> Result<Sandbox, SandboxError> {
        self.ensure_image(image).await?;

        let id = new_sandbox_id();
        let scratch = create_scratch(&self.work_root, &id)?;
        // The container runs as nobody and must be able to write build output.
        open_for_container_user(scratch.path())?;

        let config = Self::container_config(image, scratch.path(), limits);
        let options = CreateContainerOptions {
            name: id.as_str(),
            platform: None,
        };
        let container = self.docker.create_container(Some(options), config).await?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &container.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(e.into());
        }

        debug!(sandbox_id = %id, container_id = %container.id, image, "Container started");
        Ok(Sandbox::new(id, limits.clone(), scratch, Some(container.id)))
    }

    async fn run(
        &self,
        sandbox: &Sandbox,
        command: &[String],
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let container_id = sandbox
            .container_id()
            .ok_or_else(|| SandboxError::Backend(format!("sandbox {} has no container", sandbox.id())))?;

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(CONTAINER_WORKDIR.to_string()),
                    cmd: Some(command.to_vec()),
                    ..Default::default()
                },
            )
            .await?;

        let started = Instant::now();
        let (mut output, mut input) = match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(SandboxError::Backend("exec started detached".to_string()));
            }
        };

        let limit = sandbox.limits().max_output_bytes;
        let mut stdout = CappedBuffer::new(limit);
        let mut stderr = CappedBuffer::new(limit);

        let collect = async {
            let feed = async {
                if let Err(e) = input.write_all(stdin).await {
                    debug!(error = %e, "Exec stdin closed early");
                }
                let _ = input.shutdown().await;
            };
            let drain = async {
                while let Some(frame) = output.next().await {
                    match frame {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => stdout.push(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => {
                            debug!(error = %e, "Exec output stream error");
                            break;
                        }
                    }
                }
            };
            tokio::join!(feed, drain);
        };

        let timed_out = tokio::time::timeout(timeout, collect).await.is_err();
        let exit_code = if timed_out {
            // Exec processes cannot be signalled individually; the sandbox is
            // single-use after a timeout anyway.
            if let Err(e) = self
                .docker
                .kill_container(container_id, None::<KillContainerOptions<String>>)
                .await
            {
                warn!(sandbox_id = sandbox.id(), error = %e, "Failed to kill timed-out container");
            }
            None
        } else {
            self.exit_code(&exec.id).await
        };

        Ok(ExecutionOutcome {
            stdout: stdout.to_string_lossy(),
            stderr: stderr.to_string_lossy(),
            exit_code,
            elapsed_ms: started.elapsed().as_millis() as u64,
            timed_out,
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
        })
    }

    async fn release(&self, sandbox: &Sandbox) {
        if !sandbox.mark_released() {
            return;
        }
        if let Some(container_id) = sandbox.container_id() {
            let options = Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            });
            match self.docker.remove_container(container_id, options).await {
                Ok(()) => debug!(sandbox_id = sandbox.id(), "Container removed"),
                Err(e) if is_not_found(&e) => debug!(sandbox_id = sandbox.id(), "Container already gone"),
                Err(e) => warn!(sandbox_id = sandbox.id(), error = %e, "Failed to remove container"),
            }
        }
        sandbox.remove_scratch();
    }
}
