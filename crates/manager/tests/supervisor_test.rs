use async_trait::async_trait;
use axum::{routing::get, Router};
use common::{Config, Error, Result, ServiceState};
use manager::supervisor::{local_url, StopOutcome};
use manager::{ContainerRuntime, LaunchSpec, ServiceSpec, ServiceSupervisor};
use registry::{DirLock, FileRegistry, LockBackend, MemoryRegistry, RegistryStore};
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct FakeContainer {
    name: String,
    running: bool,
    server: Option<JoinHandle<()>>,
}

/// Runtime double. A launched "container" serves `/health` on its host port
/// unless the runtime is silent.
#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    launches: AtomicU32,
    fail_launch: AtomicBool,
    silent: AtomicBool,
    /// Time `launch` takes to return after the container exists.
    launch_delay: Option<Duration>,
    stopped_followers: Mutex<Vec<u32>>,
}

impl FakeRuntime {
    fn silent() -> Self {
        let runtime = Self::default();
        runtime.silent.store(true, Ordering::SeqCst);
        runtime
    }

    fn slow_launch(delay: Duration) -> Self {
        Self {
            launch_delay: Some(delay),
            ..Self::default()
        }
    }

    fn any_alive(&self) -> bool {
        self.containers.lock().unwrap().values().any(|c| c.running)
    }

    /// Simulate the container dying behind the supervisor's back.
    fn kill_externally(&self, id: &str) {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).expect("unknown container");
        container.running = false;
        if let Some(server) = container.server.take() {
            server.abort();
        }
    }

    fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    fn alive(&self, id: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|c| c.running)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::LaunchError {
                service: spec.service.clone(),
                reason: "image not found".into(),
            });
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("fake-{}-{}", spec.service, n);

        let server = if self.silent.load(Ordering::SeqCst) {
            None
        } else {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", spec.host_port))
                .await
                .map_err(|e| Error::LaunchError {
                    service: spec.service.clone(),
                    reason: e.to_string(),
                })?;
            let app = Router::new().route("/health", get(|| async { "ok" }));
            Some(tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            }))
        };

        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name: spec.container_name(),
                running: true,
                server,
            },
        );
        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn is_running(&self, container_id: &str) -> bool {
        self.alive(container_id)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        if let Some(container) = self.containers.lock().unwrap().get_mut(container_id) {
            container.running = false;
            if let Some(server) = container.server.take() {
                server.abort();
            }
        }
        Ok(())
    }

    async fn remove_by_name(&self, name: &str) -> Result<()> {
        for container in self.containers.lock().unwrap().values_mut() {
            if container.name == name {
                container.running = false;
                if let Some(server) = container.server.take() {
                    server.abort();
                }
            }
        }
        Ok(())
    }

    fn follow_logs(&self, _container_id: &str, _log_file: &Path) -> Result<u32> {
        Ok(40_000 + self.launches())
    }

    fn stop_log_follower(&self, pid: u32) -> Result<()> {
        self.stopped_followers.lock().unwrap().push(pid);
        Ok(())
    }
}

fn test_config(dir: &TempDir) -> Config {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = Config::with_state_dir(dir.path());
    config.base_port = base;
    config.port_range = 50;
    config.ready_interval = Duration::from_millis(20);
    config.ready_attempts = 20;
    config
}

fn spec(name: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        image: format!("registry.local/{name}:latest"),
        container_port: 8080,
        env: vec![],
    }
}

struct Harness {
    _dir: TempDir,
    config: Config,
    runtime: Arc<FakeRuntime>,
    registry: Arc<MemoryRegistry>,
    supervisor: ServiceSupervisor,
}

fn harness_with(runtime: FakeRuntime, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);
    let runtime = Arc::new(runtime);
    let registry = Arc::new(MemoryRegistry::new());
    let supervisor =
        ServiceSupervisor::new(config.clone(), runtime.clone(), registry.clone()).unwrap();
    Harness {
        _dir: dir,
        config,
        runtime,
        registry,
        supervisor,
    }
}

fn harness() -> Harness {
    harness_with(FakeRuntime::default(), |_| {})
}

#[tokio::test]
async fn start_wait_find_stop_scenario() {
    let h = harness();

    let started = h.supervisor.start(&spec("orders")).await.unwrap();
    assert!(!started.reused);
    assert!(started.port >= h.config.base_port);
    assert!(started.port <= h.config.base_port + h.config.port_range);

    h.supervisor.wait_ready("orders").await.unwrap();

    let url = h.registry.find("orders").await.unwrap();
    assert_eq!(url, Some(format!("http://localhost:{}", started.port)));
    assert_eq!(started.url, local_url(started.port));

    let state_file = h.config.state_file("orders").unwrap();
    let contents = std::fs::read_to_string(&state_file).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some(started.container_id.as_str()));
    let follower: u32 = lines.next().unwrap().parse().unwrap();
    assert_eq!(h.supervisor.port("orders").unwrap(), Some(started.port));
    assert_eq!(h.supervisor.url("orders").unwrap(), Some(started.url.clone()));

    let outcome = h.supervisor.stop("orders").await.unwrap();
    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            container_id: started.container_id.clone()
        }
    );
    assert!(!state_file.exists());
    assert_eq!(h.registry.find("orders").await.unwrap(), None);
    assert!(!h.runtime.alive(&started.container_id));
    assert_eq!(*h.runtime.stopped_followers.lock().unwrap(), vec![follower]);
    // The port record outlives the instance.
    assert_eq!(h.supervisor.port("orders").unwrap(), Some(started.port));
}

#[tokio::test]
async fn stop_without_start_is_nothing_to_stop() {
    let h = harness();
    assert_eq!(
        h.supervisor.stop("never-started").await.unwrap(),
        StopOutcome::NothingToStop
    );
    let report = h.supervisor.status("never-started").await.unwrap();
    assert_eq!(report.state, ServiceState::Stopped);
    assert_eq!(report.container_id, None);
}

#[tokio::test]
async fn status_detects_externally_killed_container() {
    let h = harness();
    let started = h.supervisor.start(&spec("billing")).await.unwrap();

    let report = h.supervisor.status("billing").await.unwrap();
    assert_eq!(report.state, ServiceState::Running);
    assert_eq!(report.container_id.as_deref(), Some(started.container_id.as_str()));

    h.runtime.kill_externally(&started.container_id);

    let report = h.supervisor.status("billing").await.unwrap();
    assert_eq!(report.state, ServiceState::Unknown);
    assert_eq!(report.container_id.as_deref(), Some(started.container_id.as_str()));
    // status never mutates state
    assert!(h.config.state_file("billing").unwrap().exists());

    // stop still cleans up the drifted instance
    assert!(matches!(
        h.supervisor.stop("billing").await.unwrap(),
        StopOutcome::Stopped { .. }
    ));
    assert_eq!(
        h.supervisor.stop("billing").await.unwrap(),
        StopOutcome::NothingToStop
    );
    assert_eq!(h.registry.find("billing").await.unwrap(), None);
}

#[tokio::test]
async fn launch_failure_leaves_no_trace() {
    let h = harness();
    h.runtime.fail_launch.store(true, Ordering::SeqCst);

    let err = h.supervisor.start(&spec("orders")).await.unwrap_err();
    assert!(matches!(err, Error::LaunchError { .. }), "{err}");
    assert_ne!(err.exit_code(), 0);
    assert!(h.registry.list().await.unwrap().is_empty());
    assert!(!h.config.state_file("orders").unwrap().exists());
}

#[tokio::test]
async fn readiness_times_out_after_bounded_attempts() {
    let h = harness_with(FakeRuntime::silent(), |c| c.ready_attempts = 3);
    h.supervisor.start(&spec("slow")).await.unwrap();

    match h.supervisor.wait_ready("slow").await {
        Err(Error::ReadinessTimeout { attempts, url, .. }) => {
            assert_eq!(attempts, 3);
            assert!(url.ends_with("/health"));
        }
        other => panic!("expected ReadinessTimeout, got {other:?}"),
    }
    // The instance itself stays up.
    let report = h.supervisor.status("slow").await.unwrap();
    assert_eq!(report.state, ServiceState::Running);
}

#[tokio::test]
async fn readiness_wait_is_capped_when_probe_hangs() {
    let h = harness_with(FakeRuntime::silent(), |c| {
        c.ready_attempts = 3;
        c.ready_interval = Duration::from_millis(200);
    });
    let started = h.supervisor.start(&spec("stuck")).await.unwrap();
    // Accepts connections but never answers.
    let _hanging = TcpListener::bind(("127.0.0.1", started.port)).unwrap();

    let begun = std::time::Instant::now();
    let err = h.supervisor.wait_ready("stuck").await.unwrap_err();
    let waited = begun.elapsed();

    assert!(matches!(err, Error::ReadinessTimeout { .. }), "{err}");
    assert!(waited < Duration::from_millis(1_500), "waited {waited:?}");
}

#[tokio::test]
async fn wait_without_start_is_an_error() {
    let h = harness();
    assert!(h.supervisor.wait_ready("orders").await.is_err());
}

#[tokio::test]
async fn start_reuses_live_instance() {
    let h = harness();
    let first = h.supervisor.start(&spec("orders")).await.unwrap();
    let second = h.supervisor.start(&spec("orders")).await.unwrap();

    assert!(second.reused);
    assert_eq!(second.container_id, first.container_id);
    assert_eq!(second.port, first.port);
    assert_eq!(h.runtime.launches(), 1);
}

#[tokio::test]
async fn start_replaces_stale_instance() {
    let h = harness();
    let first = h.supervisor.start(&spec("orders")).await.unwrap();
    h.runtime.kill_externally(&first.container_id);

    let second = h.supervisor.start(&spec("orders")).await.unwrap();
    assert!(!second.reused);
    assert_ne!(second.container_id, first.container_id);
    assert_eq!(h.runtime.launches(), 2);
    assert_eq!(
        h.supervisor.status("orders").await.unwrap().state,
        ServiceState::Running
    );
}

#[tokio::test]
async fn interrupt_during_readiness_cleans_up() {
    let h = harness_with(FakeRuntime::silent(), |c| c.ready_attempts = 500);
    let interrupt = tokio::time::sleep(Duration::from_millis(150));

    let err = h
        .supervisor
        .start_until(&spec("orders"), true, interrupt)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LaunchError { ref reason, .. } if reason == "interrupted"));

    assert!(!h.config.state_file("orders").unwrap().exists());
    assert_eq!(h.registry.find("orders").await.unwrap(), None);
    assert!(!h.runtime.alive("fake-orders-1"));
}

#[tokio::test]
async fn interrupt_during_launch_removes_container() {
    let h = harness_with(FakeRuntime::slow_launch(Duration::from_millis(300)), |_| {});
    let interrupt = tokio::time::sleep(Duration::from_millis(50));

    let err = h
        .supervisor
        .start_until(&spec("orders"), false, interrupt)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LaunchError { ref reason, .. } if reason == "interrupted"));

    assert_eq!(h.runtime.launches(), 1);
    assert!(!h.runtime.any_alive());
    assert!(!h.config.state_file("orders").unwrap().exists());
    assert_eq!(h.registry.find("orders").await.unwrap(), None);
}

#[tokio::test]
async fn start_until_waits_for_readiness() {
    let h = harness();
    let started = h
        .supervisor
        .start_until(&spec("orders"), true, std::future::pending::<()>())
        .await
        .unwrap();
    assert_eq!(
        h.registry.find("orders").await.unwrap(),
        Some(started.url)
    );
}

#[tokio::test]
async fn registry_failure_rolls_back_launch() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let lock = DirLock::new(config.lock_dir())
        .with_retry_interval(Duration::from_millis(5))
        .with_max_wait(Some(Duration::from_millis(50)));
    let registry = Arc::new(FileRegistry::new(config.registry_file(), Arc::new(lock.clone())));
    let runtime = Arc::new(FakeRuntime::default());
    let supervisor =
        ServiceSupervisor::new(config.clone(), runtime.clone(), registry.clone()).unwrap();

    let held = lock.acquire().await.unwrap();
    let err = supervisor.start(&spec("orders")).await.unwrap_err();
    assert!(err.is_lock_liveness_hazard(), "{err}");
    assert!(!runtime.alive("fake-orders-1"));
    assert!(!config.state_file("orders").unwrap().exists());
    drop(held);

    assert_eq!(registry.find("orders").await.unwrap(), None);
}

#[tokio::test]
async fn exhausted_port_range_fails_start() {
    let held = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port();
    let h = harness_with(FakeRuntime::default(), |c| {
        c.base_port = port;
        c.port_range = 0;
    });

    let err = h.supervisor.start(&spec("orders")).await.unwrap_err();
    assert!(matches!(err, Error::NoPortAvailable { .. }), "{err}");
    assert_eq!(h.runtime.launches(), 0);
}

#[tokio::test]
async fn rejects_invalid_service_names() {
    let h = harness();
    assert!(matches!(
        h.supervisor.start(&spec("../escape")).await,
        Err(Error::InvalidName { .. })
    ));
    assert!(h.supervisor.status("a=b").await.is_err());
}

#[tokio::test]
async fn readiness_probe_bypasses_system_proxy() {
    // The only HTTP clients in this binary are the supervisor's, so an
    // unreachable proxy here cannot affect the other tests.
    std::env::set_var("HTTP_PROXY", "http://127.0.0.1:9");
    std::env::set_var("http_proxy", "http://127.0.0.1:9");
    let h = harness();
    h.supervisor.start(&spec("proxied")).await.unwrap();
    h.supervisor.wait_ready("proxied").await.unwrap();
}
