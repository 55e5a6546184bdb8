//! Container runtime seam. The supervisor only needs launch, liveness, stop
//! and a background log follower; [`DockerCli`] provides them through the
//! `docker` binary.

use async_trait::async_trait;
use common::{Error, Result};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub service: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn container_name(&self) -> String {
        container_name(&self.service)
    }
}

/// Name given to a service's container so a leftover from an interrupted
/// start can be found and removed without knowing its id.
pub fn container_name(service: &str) -> String {
    format!("svcmgr-{service}")
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start the container detached and return its identifier.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    async fn is_running(&self, container_id: &str) -> bool;

    /// Stop the container. Succeeds if it is already gone.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Force-remove the container called `name`. Succeeds if there is none.
    async fn remove_by_name(&self, name: &str) -> Result<()>;

    /// Spawn a detached process appending the container's output to
    /// `log_file`. Returns its pid.
    fn follow_logs(&self, container_id: &str, log_file: &Path) -> Result<u32>;

    /// Terminate a log follower by pid. Succeeds if it already exited.
    fn stop_log_follower(&self, pid: u32) -> Result<()> {
        terminate_pid(pid)
    }
}

#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| Error::Runtime(format!("invalid pid {pid}")))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Runtime(format!("failed to signal pid {pid}: {e}"))),
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(pid: u32) -> Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    // taskkill exits 128 when the process does not exist.
    if status.success() || status.code() == Some(128) {
        Ok(())
    } else {
        Err(Error::Runtime(format!("taskkill failed for pid {pid}")))
    }
}

/// Runtime backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker", Duration::from_secs(120))
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let cmd = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %cmd, "running container runtime");
        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::Runtime(format!("failed to execute '{cmd}': {e}"))),
            Err(_) => Err(Error::Runtime(format!(
                "'{cmd}' timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let launch_err = |reason: String| Error::LaunchError {
            service: spec.service.clone(),
            reason,
        };
        let name = spec.container_name();

        // A container left behind by an interrupted start would hold the name.
        let _ = self.remove_by_name(&name).await;

        let publish = format!("{}:{}", spec.host_port, spec.container_port);
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args: Vec<&str> = vec!["run", "-d", "--rm", "--name", name.as_str(), "-p", publish.as_str()];
        for pair in &env {
            args.push("-e");
            args.push(pair.as_str());
        }
        args.push(spec.image.as_str());

        let output = self.run(&args).await.map_err(|e| launch_err(e.to_string()))?;
        if !output.status.success() {
            return Err(launch_err(stderr_of(&output)));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(launch_err("runtime returned no container id".to_string()));
        }
        Ok(id)
    }

    async fn is_running(&self, container_id: &str) -> bool {
        match self
            .run(&["inspect", "-f", "{{.State.Running}}", container_id])
            .await
        {
            Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).trim() == "true",
            _ => false,
        }
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let output = self.run(&["stop", container_id]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if stderr.contains("No such container") || stderr.contains("is not running") {
            return Ok(());
        }
        Err(Error::Runtime(format!("docker stop {container_id}: {stderr}")))
    }

    async fn remove_by_name(&self, name: &str) -> Result<()> {
        let output = self.run(&["rm", "-f", name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(Error::Runtime(format!("docker rm -f {name}: {stderr}")))
    }

    fn follow_logs(&self, container_id: &str, log_file: &Path) -> Result<u32> {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let out = OpenOptions::new().create(true).append(true).open(log_file)?;
        let err = out.try_clone()?;

        // Not waited on: the follower outlives this invocation and exits
        // with the container, or when stop() signals it.
        let child = std::process::Command::new(&self.binary)
            .args(["logs", "-f", container_id])
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .map_err(|e| Error::Runtime(format!("failed to start log follower: {e}")))?;
        Ok(child.id())
    }
}
