//! Lifecycle of one container per logical service name.
//!
//! The state file under `<state_dir>/services/<name>.state` is the only
//! record of what this tool launched. `status` and `stop` work from it even
//! when the registry write of a previous `start` failed. Starting the same
//! name from two invocations at once is not guarded against.

use crate::ports::PortAllocator;
use crate::runtime::{container_name, ContainerRuntime, LaunchSpec};
use common::{Config, Error, InstanceState, Result, ServiceState, StatusReport};
use registry::RegistryStore;
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-request floor for readiness probes when the interval is very short.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    /// Image reference handed to the container runtime as-is.
    pub image: String,
    pub container_port: u16,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedInstance {
    pub name: String,
    pub container_id: String,
    pub port: u16,
    pub url: String,
    /// An instance launched by an earlier invocation was still alive.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NothingToStop,
    Stopped { container_id: String },
}

pub fn local_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

pub struct ServiceSupervisor {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn RegistryStore>,
    ports: PortAllocator,
    http: reqwest::Client,
}

impl ServiceSupervisor {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryStore>,
    ) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            ports: PortAllocator::from_config(&config),
            config,
            runtime,
            registry,
            http,
        })
    }

    fn transition(&self, name: &str, from: ServiceState, to: ServiceState) {
        debug_assert!(from.can_transition_to(to), "{from} -> {to}");
        debug!(service = name, "{} -> {}", from, to);
    }

    // ------------------------------------------------------------------
    // Persisted per-service files
    // ------------------------------------------------------------------

    pub fn read_state(&self, name: &str) -> Result<Option<InstanceState>> {
        let path = self.config.state_file(name)?;
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let state = InstanceState::parse(&contents);
                if state.is_none() {
                    warn!(path = %path.display(), "ignoring unreadable state file");
                }
                Ok(state)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_state(&self, name: &str, state: &InstanceState) -> Result<()> {
        let path = self.config.state_file(name)?;
        fs::create_dir_all(self.config.services_dir())?;
        fs::write(path, state.to_file_contents())?;
        Ok(())
    }

    fn clear_state(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.config.state_file(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Most recently allocated host port. Left in place by `stop`.
    pub fn port(&self, name: &str) -> Result<Option<u16>> {
        match fs::read_to_string(self.config.port_file(name)?) {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn url(&self, name: &str) -> Result<Option<String>> {
        Ok(self.port(name)?.map(local_url))
    }

    fn write_port(&self, name: &str, port: u16) -> Result<()> {
        fs::create_dir_all(self.config.services_dir())?;
        fs::write(self.config.port_file(name)?, format!("{port}\n"))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self, spec: &ServiceSpec) -> Result<StartedInstance> {
        let name = spec.name.as_str();
        common::validate_name(name)?;
        if spec.image.trim().is_empty() {
            return Err(Error::Config(format!("no image given for '{name}'")));
        }

        let mut from = ServiceState::Stopped;
        if let Some(existing) = self.read_state(name)? {
            if self.runtime.is_running(&existing.container_id).await {
                if let Some(port) = self.port(name)? {
                    let url = local_url(port);
                    self.registry.register(name, &url).await?;
                    info!(service = name, container = %existing.container_id, "already running");
                    return Ok(StartedInstance {
                        name: name.to_string(),
                        container_id: existing.container_id,
                        port,
                        url,
                        reused: true,
                    });
                }
            }
            warn!(service = name, container = %existing.container_id, "clearing stale instance state");
            from = ServiceState::Unknown;
            self.teardown(name, &existing).await?;
        }

        self.transition(name, from, ServiceState::Starting);
        let port = self.ports.allocate()?;
        let launch = LaunchSpec {
            service: name.to_string(),
            image: spec.image.clone(),
            host_port: port,
            container_port: spec.container_port,
            env: spec.env.clone(),
        };
        let container_id = self.runtime.launch(&launch).await?;
        info!(service = name, port, container = %container_id, "container launched");

        let mut state = InstanceState::new(&container_id);
        let url = local_url(port);
        let recorded = async {
            self.write_state(name, &state)?;
            self.write_port(name, port)?;
            self.registry.register(name, &url).await
        }
        .await;
        if let Err(e) = recorded {
            warn!(service = name, "rolling back launch: {}", e);
            if let Err(cleanup) = self.teardown(name, &state).await {
                warn!(service = name, "rollback incomplete: {}", cleanup);
            }
            return Err(e);
        }

        match self.config.log_file(name).and_then(|log| self.runtime.follow_logs(&container_id, &log)) {
            Ok(pid) => {
                state.log_follower_pid = Some(pid);
                self.write_state(name, &state)?;
            }
            Err(e) => warn!(service = name, "log follower not started: {}", e),
        }

        self.transition(name, ServiceState::Starting, ServiceState::Running);
        Ok(StartedInstance {
            name: name.to_string(),
            container_id,
            port,
            url,
            reused: false,
        })
    }

    /// Poll the probe endpoint on the recorded port until it answers 2xx.
    /// Attempts run on a fixed cadence and the whole wait is capped at
    /// `ready_attempts * ready_interval`, however slowly the probe answers.
    pub async fn wait_ready(&self, name: &str) -> Result<()> {
        let port = self
            .port(name)?
            .ok_or_else(|| Error::Runtime(format!("no port recorded for '{name}', start it first")))?;
        let url = format!("{}{}", local_url(port), self.config.probe_path);
        let attempts = self.config.ready_attempts;
        let interval = self.config.ready_interval;
        let started = Instant::now();
        let deadline = started + interval.saturating_mul(attempts);

        for attempt in 1..=attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let request_timeout = interval.max(MIN_PROBE_TIMEOUT).min(remaining);
            match self.http.get(&url).timeout(request_timeout).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(service = name, attempt, "ready");
                    return Ok(());
                }
                Ok(resp) => debug!(service = name, attempt, status = %resp.status(), "not ready"),
                Err(e) => debug!(service = name, attempt, "not ready: {}", e),
            }
            if attempt < attempts {
                tokio::time::sleep_until(started + interval.saturating_mul(attempt)).await;
            }
        }

        Err(Error::ReadinessTimeout {
            service: name.to_string(),
            url,
            attempts,
        })
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let Some(state) = self.read_state(name)? else {
            info!(service = name, "nothing to stop");
            return Ok(StopOutcome::NothingToStop);
        };

        self.transition(name, ServiceState::Running, ServiceState::Stopping);
        self.teardown(name, &state).await?;
        self.registry.remove(name).await?;
        self.transition(name, ServiceState::Stopping, ServiceState::Stopped);
        info!(service = name, container = %state.container_id, "stopped");
        Ok(StopOutcome::Stopped {
            container_id: state.container_id,
        })
    }

    /// Best-effort container and follower shutdown, then drop the state file.
    async fn teardown(&self, name: &str, state: &InstanceState) -> Result<()> {
        if let Err(e) = self.runtime.stop(&state.container_id).await {
            warn!(service = name, container = %state.container_id, "container stop failed: {}", e);
        }
        if let Some(pid) = state.log_follower_pid {
            if let Err(e) = self.runtime.stop_log_follower(pid) {
                warn!(service = name, pid, "log follower stop failed: {}", e);
            }
        }
        self.clear_state(name)
    }

    /// Compare the state file with what the runtime reports. Read-only.
    pub async fn status(&self, name: &str) -> Result<StatusReport> {
        let port = self.port(name)?;
        let (state, container_id) = match self.read_state(name)? {
            None => (ServiceState::Stopped, None),
            Some(s) if self.runtime.is_running(&s.container_id).await => {
                (ServiceState::Running, Some(s.container_id))
            }
            Some(s) => (ServiceState::Unknown, Some(s.container_id)),
        };
        Ok(StatusReport {
            name: name.to_string(),
            state,
            container_id,
            port,
        })
    }

    /// `start`, optionally followed by `wait_ready`, abandoned and cleaned up
    /// with `stop` if `interrupt` resolves first.
    pub async fn start_until<I>(
        &self,
        spec: &ServiceSpec,
        wait: bool,
        interrupt: I,
    ) -> Result<StartedInstance>
    where
        I: Future<Output = ()>,
    {
        let work = async {
            let started = self.start(spec).await?;
            if wait {
                self.wait_ready(&spec.name).await?;
            }
            Ok(started)
        };

        tokio::select! {
            result = work => result,
            _ = interrupt => {
                warn!(service = %spec.name, "interrupted, cleaning up");
                if let Err(e) = self.stop(&spec.name).await {
                    warn!(service = %spec.name, "cleanup after interrupt failed: {}", e);
                }
                // The launch may have created the container without returning
                // its id, so no state file names it.
                if let Err(e) = self.runtime.remove_by_name(&container_name(&spec.name)).await {
                    warn!(service = %spec.name, "removing container by name failed: {}", e);
                }
                Err(Error::LaunchError {
                    service: spec.name.clone(),
                    reason: "interrupted".to_string(),
                })
            }
        }
    }
}
