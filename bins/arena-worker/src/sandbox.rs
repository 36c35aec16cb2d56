//! Sandboxed Executor - runs one program and reports what it did
//!
//! **Core Responsibility:**
//! Launch a command in an isolated, ephemeral container (or, on the fallback
//! path, as a plain local process), bound it by a wall-clock timeout and
//! return exit code, stdout and stderr.
//!
//! **Boundary:**
//! - Knows nothing about test cases or grading
//! - Knows nothing about languages beyond the command it is given
//!
//! **Container policy (fixed for every language):**
//! - No network (`--net none`, networking disabled)
//! - PID, CPU and memory ceilings
//! - Read-only root filesystem; only the workspace mount and a small
//!   in-memory `/tmp` are writable
//! - Non-root numeric user, all capabilities dropped, no privilege escalation

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Where the host workspace appears inside the container
pub const MOUNT_POINT: &str = "/work";

/// In-memory scratch inside the otherwise read-only container
const SCRATCH_TMP: &str = "/tmp";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("isolation backend unavailable: {0}")]
    IsolationUnavailable(String),
    #[error("sandbox error: {0}")]
    Docker(bollard::errors::Error),
    #[error("process error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon-side failures (bad image, rejected config) are real errors; anything
/// that never reached the daemon means the backend is not there.
fn classify_docker_error(err: bollard::errors::Error) -> SandboxError {
    use bollard::errors::Error;
    match err {
        Error::DockerResponseServerError { .. }
        | Error::DockerStreamError { .. }
        | Error::DockerContainerWaitError { .. } => SandboxError::Docker(err),
        other => SandboxError::IsolationUnavailable(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    pub image: &'a str,
    /// Run as `sh -c <command>` inside the container
    pub command: &'a str,
    /// Host directory mounted read-write at `MOUNT_POINT`
    pub workdir: &'a Path,
    pub timeout: Duration,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecOutput, SandboxError>;
}

/// Resource ceilings applied to every container
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub user: String,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            nano_cpus: 500_000_000, // 0.5 CPU
            pids_limit: 64,
            user: "1000:1000".to_string(),
        }
    }
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Cannot await in Drop
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

/// Docker-backed sandbox
pub struct DockerSandbox {
    docker: Docker,
    policy: SandboxPolicy,
}

impl DockerSandbox {
    /// Connect to the local daemon and make sure it answers
    pub async fn connect(policy: SandboxPolicy) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::IsolationUnavailable(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::IsolationUnavailable(e.to_string()))?;

        info!(
            memory_bytes = policy.memory_bytes,
            nano_cpus = policy.nano_cpus,
            pids_limit = policy.pids_limit,
            user = %policy.user,
            "Docker sandbox ready"
        );
        Ok(Self { docker, policy })
    }

    /// Pull the image if it is not in the local cache
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(classify_docker_error)?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }
}

/// Container settings for one request under `policy`
fn container_config(policy: &SandboxPolicy, request: &SandboxRequest<'_>, host_dir: &str) -> Config<String> {
    Config {
        image: Some(request.image.to_string()),
        cmd: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            request.command.to_string(),
        ]),
        user: Some(policy.user.clone()),
        working_dir: Some(MOUNT_POINT.to_string()),
        env: Some(vec![format!("TMPDIR={}", SCRATCH_TMP)]),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:{}:rw", host_dir, MOUNT_POINT)]),
            network_mode: Some("none".to_string()),
            memory: Some(policy.memory_bytes),
            memory_swap: Some(policy.memory_bytes),
            nano_cpus: Some(policy.nano_cpus),
            pids_limit: Some(policy.pids_limit),
            readonly_rootfs: Some(true),
            // compilers need somewhere to put intermediates
            tmpfs: Some(HashMap::from([(
                SCRATCH_TMP.to_string(),
                "rw,noexec,nosuid,size=64m".to_string(),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecOutput, SandboxError> {
        let host_dir = request.workdir.to_str().ok_or_else(|| {
            SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "workspace path is not valid UTF-8",
            ))
        })?;

        self.ensure_image(request.image).await?;

        let container_name = format!("arena-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), container_config(&self.policy, &request, host_dir))
            .await
            .map_err(classify_docker_error)?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify_docker_error)?;

        let execution = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });

            let mut logs_stream = self.docker.logs(&container_id, logs_options);
            while let Some(output) = logs_stream.next().await {
                match output? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));

            // bollard reports a non-zero exit as an error carrying the code
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(e),
                None => -1,
            };

            Ok::<(i64, String, String), bollard::errors::Error>((exit_code, stdout, stderr))
        };

        match tokio::time::timeout(request.timeout, execution).await {
            Ok(Ok((exit_code, stdout, stderr))) => {
                let execution_time_ms = start_time.elapsed().as_millis() as u64;
                debug!(
                    container_id = %container_id,
                    exit_code = exit_code,
                    execution_ms = execution_time_ms,
                    "Container exited"
                );
                Ok(ExecOutput {
                    exit_code,
                    stdout,
                    stderr,
                    execution_time_ms,
                })
            }
            Ok(Err(e)) => Err(classify_docker_error(e)),
            Err(_) => {
                warn!(
                    container_id = %container_id,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "Execution timed out, killing container"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }
                Err(SandboxError::Timeout(request.timeout))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalRequest<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub workdir: &'a Path,
    pub stdin: Option<&'a str>,
    pub timeout: Duration,
}

/// Unsandboxed execution: a direct child process with only a timeout.
///
/// Provides no memory, filesystem, network or privilege isolation. Use only
/// where the submitted code is trusted.
#[derive(Debug, Clone, Default)]
pub struct LocalProcess;

impl LocalProcess {
    pub async fn run(&self, request: LocalRequest<'_>) -> Result<ExecOutput, SandboxError> {
        let mut command = Command::new(request.program);
        command
            .args(request.args)
            .current_dir(request.workdir)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own group, so anything the program forks is killed with it
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let start_time = Instant::now();

        if let (Some(mut pipe), Some(data)) = (child.stdin.take(), request.stdin) {
            let data = data.to_owned();
            // Fed from a task so a program that never reads cannot block us
            tokio::spawn(async move {
                let _ = pipe.write_all(data.as_bytes()).await;
            });
        }

        let mut stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        // A forked process can hold the pipes open after the child exits,
        // so the reads share the deadline with the wait
        let waited = tokio::time::timeout(request.timeout, async {
            let status = child.wait().await?;
            let stdout = (&mut stdout_task).await.unwrap_or_default();
            let stderr = (&mut stderr_task).await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        kill_process_group(pid);

        match waited {
            Ok(Ok((status, stdout, stderr))) => Ok(ExecOutput {
                // killed by a signal
                exit_code: status.code().map(i64::from).unwrap_or(-1),
                stdout,
                stderr,
                execution_time_ms: start_time.elapsed().as_millis() as u64,
            }),
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Timed-out process already gone");
                }
                stdout_task.abort();
                stderr_task.abort();
                Err(SandboxError::Timeout(request.timeout))
            }
        }
    }
}

/// SIGKILL every process left in the child's group
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // ESRCH just means the group is already empty
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            warn!(pid = pid, error = %e, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// In-container path of `name` inside the mounted workspace
pub fn sandbox_path(name: &str) -> String {
    format!("{}/{}", MOUNT_POINT, name)
}
