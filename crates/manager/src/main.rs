use clap::{Args, Parser, Subcommand};
use common::version::{read_marker_from_file, stamp_marker};
use common::{Config, Error, Result, ServiceState, VersionTag};
use manager::cache::write_executable;
use manager::supervisor::StopOutcome;
use manager::{
    DockerCli, FileCache, HttpFetcher, SelfUpdateController, ServiceSpec, ServiceSupervisor,
};
use registry::{DirLock, FileRegistry, RegistryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

/// Global settings; every flag can also come from the environment.
#[derive(Args)]
struct Settings {
    /// Base directory for registry, cache and per-service state
    #[arg(long, global = true, env = "SVCMGR_HOME")]
    home: Option<PathBuf>,

    /// Directory for container log files (default: <home>/logs)
    #[arg(long, global = true, env = "SVCMGR_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// First port tried when allocating a host port
    #[arg(long, global = true, env = "SVCMGR_BASE_PORT", default_value_t = common::config::DEFAULT_BASE_PORT)]
    base_port: u16,

    /// How many ports above the base port may be tried
    #[arg(long, global = true, env = "SVCMGR_PORT_RANGE", default_value_t = common::config::DEFAULT_PORT_RANGE)]
    port_range: u16,

    /// Milliseconds between registry lock attempts
    #[arg(long, global = true, env = "SVCMGR_LOCK_RETRY_MS", default_value_t = 1000)]
    lock_retry_ms: u64,

    /// Give up on the registry lock after this many seconds (default: wait forever)
    #[arg(long, global = true, env = "SVCMGR_LOCK_MAX_WAIT_SECS")]
    lock_max_wait_secs: Option<u64>,

    /// Break a registry lock older than this many seconds (default: never)
    #[arg(long, global = true, env = "SVCMGR_LOCK_STALE_SECS")]
    lock_stale_secs: Option<u64>,

    /// Seconds a cached manager payload stays fresh
    #[arg(long, global = true, env = "SVCMGR_CACHE_TTL_SECS", default_value_t = 3600)]
    cache_ttl_secs: u64,

    /// Timeout for remote fetches in seconds
    #[arg(long, global = true, env = "SVCMGR_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    fetch_timeout_secs: u64,

    /// Readiness probe attempts
    #[arg(long, global = true, env = "SVCMGR_READY_ATTEMPTS", default_value_t = common::config::DEFAULT_READY_ATTEMPTS)]
    ready_attempts: u32,

    /// Seconds between readiness probe attempts
    #[arg(long, global = true, env = "SVCMGR_READY_INTERVAL_SECS", default_value_t = 5)]
    ready_interval_secs: u64,

    /// HTTP path probed for readiness
    #[arg(long, global = true, env = "SVCMGR_PROBE_PATH", default_value = common::config::DEFAULT_PROBE_PATH)]
    probe_path: String,

    /// Source of the manager payload
    #[arg(long, global = true, env = "SVCMGR_MANAGER_URL")]
    manager_url: Option<String>,

    /// Source of the wrapper script
    #[arg(long, global = true, env = "SVCMGR_WRAPPER_URL")]
    wrapper_url: Option<String>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl Settings {
    fn into_config(self) -> Config {
        let mut config = match self.home {
            Some(home) => Config::with_state_dir(home),
            None => Config::default(),
        };
        if let Some(log_dir) = self.log_dir {
            config.log_dir = log_dir;
        }
        config.base_port = self.base_port;
        config.port_range = self.port_range;
        config.lock_retry_interval = Duration::from_millis(self.lock_retry_ms);
        config.lock_max_wait = self.lock_max_wait_secs.map(Duration::from_secs);
        config.lock_stale_after = self.lock_stale_secs.map(Duration::from_secs);
        config.cache_ttl = Duration::from_secs(self.cache_ttl_secs);
        config.fetch_timeout = Duration::from_secs(self.fetch_timeout_secs);
        config.ready_attempts = self.ready_attempts;
        config.ready_interval = Duration::from_secs(self.ready_interval_secs);
        config.probe_path = self.probe_path;
        config.manager_url = self.manager_url;
        config.wrapper_url = self.wrapper_url;
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start a service container on a free port and register its URL
    Start {
        name: String,
        /// Image reference to run
        #[arg(long, env = "SVCMGR_IMAGE")]
        image: String,
        /// Port the service listens on inside the container
        #[arg(long, default_value_t = 8080)]
        container_port: u16,
        /// Environment passed to the container (KEY=VALUE)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        /// Block until the readiness probe succeeds
        #[arg(long)]
        wait: bool,
    },
    /// Stop a service container and deregister it
    Stop { name: String },
    /// Show whether a service container is running
    Status { name: String },
    /// Wait for a started service to pass its readiness probe
    Wait { name: String },
    /// Register a service URL
    Register { name: String, url: String },
    /// Print the URL registered for a service
    Find { name: String },
    /// Remove a service from the registry
    Remove { name: String },
    /// List all registered services
    List,
    /// Forcibly remove the registry lock left by a crashed invocation
    Unlock,
    /// Refresh the cached manager payload if it is older than the TTL
    EnsureLatest,
    /// Warn if the wrapper script is behind its source
    CheckUpdate {
        #[arg(long, env = "SVCMGR_SCRIPT")]
        script: Option<PathBuf>,
    },
    /// Replace the wrapper script with the latest version from its source
    UpdateSelf {
        #[arg(long, env = "SVCMGR_SCRIPT")]
        script: Option<PathBuf>,
    },
    /// Run the cached manager payload with the given arguments
    Exec {
        /// Wrapper script checked against its source before running
        #[arg(long, env = "SVCMGR_SCRIPT")]
        script: Option<PathBuf>,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Write a fresh version marker into a script
    Stamp {
        file: PathBuf,
        /// Source revision recorded after the '+'
        #[arg(long)]
        hash: String,
    },
}

fn parse_env_pair(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn script_path(script: Option<PathBuf>) -> Result<PathBuf> {
    match script {
        Some(path) => Ok(path),
        None => Ok(std::env::current_exe()?),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.settings.verbose);
    let config = cli.settings.into_config();

    match run(cli.command, config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            for hint in hints(&e) {
                eprintln!("hint: {}", hint);
            }
            std::process::exit(e.exit_code());
        }
    }
}

/// Recovery advice printed after the error itself.
fn hints(e: &Error) -> Vec<String> {
    let mut hints = Vec::new();
    if e.is_lock_liveness_hazard() {
        hints.push("if no other svcmgr is running, clear the lock with `svcmgr unlock`".to_string());
    }
    if let Error::ReadinessTimeout { service, .. } = e {
        hints.push(format!("the container is still running; `svcmgr stop {service}` removes it"));
    }
    hints
}

async fn run(command: Commands, config: Config) -> Result<i32> {
    config.validate()?;

    match command {
        Commands::Start {
            name,
            image,
            container_port,
            env,
            wait,
        } => {
            let supervisor = supervisor(&config)?;
            let spec = ServiceSpec {
                name,
                image,
                container_port,
                env,
            };
            let interrupt = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            let started = supervisor.start_until(&spec, wait, interrupt).await?;
            if started.reused {
                println!("{} already running at {}", started.name, started.url);
            } else {
                println!("Started {} at {}", started.name, started.url);
            }
            println!("Container: {}", started.container_id);
        }
        Commands::Stop { name } => match supervisor(&config)?.stop(&name).await? {
            StopOutcome::NothingToStop => println!("Nothing to stop for {}", name),
            StopOutcome::Stopped { container_id } => {
                println!("Stopped {} (container {})", name, container_id)
            }
        },
        Commands::Status { name } => {
            let report = supervisor(&config)?.status(&name).await?;
            let port = report
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            match (report.state, report.container_id) {
                (ServiceState::Running, Some(id)) => {
                    println!("{}: running (container {}, port {})", name, id, port)
                }
                (_, Some(id)) => println!("{}: not running (stale container {})", name, id),
                _ => println!("{}: stopped", name),
            }
        }
        Commands::Wait { name } => {
            supervisor(&config)?.wait_ready(&name).await?;
            println!("{} is ready", name);
        }
        Commands::Register { name, url } => {
            FileRegistry::from_config(&config).register(&name, &url).await?;
            println!("Registered {}={}", name, url);
        }
        Commands::Find { name } => match FileRegistry::from_config(&config).find(&name).await? {
            Some(url) => println!("{}", url),
            None => {
                eprintln!("No URL registered for service: {}", name);
                return Ok(1);
            }
        },
        Commands::Remove { name } => {
            if FileRegistry::from_config(&config).remove(&name).await? {
                println!("Removed {}", name);
            } else {
                println!("{} was not registered", name);
            }
        }
        Commands::List => {
            for record in FileRegistry::from_config(&config).list().await? {
                println!("{}={}", record.name, record.url);
            }
        }
        Commands::Unlock => {
            if DirLock::from_config(&config).force_release()? {
                println!("Removed lock {}", config.lock_dir().display());
            } else {
                println!("No lock present");
            }
        }
        Commands::EnsureLatest => {
            let status = updater(&config)?.ensure_latest_manager().await?;
            let version = status
                .version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            if status.refreshed {
                println!("Fetched manager {}", version);
            } else {
                println!("Manager {} is current", version);
            }
        }
        Commands::CheckUpdate { script } => {
            let script = script_path(script)?;
            if let Some(notice) = updater(&config)?.check_self_update(&script).await {
                eprintln!(
                    "A newer version is available ({} -> {}). Run `{}` to update.",
                    notice.local, notice.remote, notice.command
                );
            }
        }
        Commands::UpdateSelf { script } => {
            let script = script_path(script)?;
            let report = updater(&config)?.update_self(&script).await?;
            let show = |v: Option<VersionTag>| v.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into());
            println!("Updated {}: {} -> {}", script.display(), show(report.old), show(report.new));
        }
        Commands::Exec { script, args } => {
            return updater(&config)?
                .with_script(script_path(script)?)
                .run_manager(&args)
                .await;
        }
        Commands::Stamp { file, hash } => {
            let tag = VersionTag::now(hash);
            let payload = std::fs::read_to_string(&file)?;
            let previous = read_marker_from_file(&file)?;
            write_executable(&file, stamp_marker(&payload, &tag).as_bytes())?;
            match previous {
                Some(old) => println!("{}: {} -> {}", file.display(), old, tag),
                None => println!("{}: {}", file.display(), tag),
            }
        }
    }

    Ok(0)
}

fn supervisor(config: &Config) -> Result<ServiceSupervisor> {
    ServiceSupervisor::new(
        config.clone(),
        Arc::new(DockerCli::default()),
        Arc::new(FileRegistry::from_config(config)),
    )
}

fn updater(config: &Config) -> Result<SelfUpdateController> {
    Ok(SelfUpdateController::new(
        config,
        Arc::new(HttpFetcher::new(config.fetch_timeout)?),
        Arc::new(FileCache::new(config.cache_file())),
    ))
}
