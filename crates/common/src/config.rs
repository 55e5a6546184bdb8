use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_PORT: u16 = 8080;
pub const DEFAULT_PORT_RANGE: u16 = 100;
pub const DEFAULT_LOCK_RETRY: Duration = Duration::from_secs(1);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READY_ATTEMPTS: u32 = 20;
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_PATH: &str = "/health";

/// Every tunable of the tool. Paths derive from `state_dir` unless set.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub base_port: u16,
    pub port_range: u16,
    pub lock_retry_interval: Duration,
    /// `None` waits for the registry lock forever.
    pub lock_max_wait: Option<Duration>,
    /// `None` never force-releases a lock left behind by a crashed holder.
    pub lock_stale_after: Option<Duration>,
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub probe_path: String,
    pub manager_url: Option<String>,
    pub wrapper_url: Option<String>,
}

/// Get the default state directory (~/.svcmgr)
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".svcmgr")
}

impl Default for Config {
    fn default() -> Self {
        Self::with_state_dir(default_state_dir())
    }
}

impl Config {
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            log_dir: state_dir.join("logs"),
            state_dir,
            base_port: DEFAULT_BASE_PORT,
            port_range: DEFAULT_PORT_RANGE,
            lock_retry_interval: DEFAULT_LOCK_RETRY,
            lock_max_wait: None,
            lock_stale_after: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            ready_attempts: DEFAULT_READY_ATTEMPTS,
            ready_interval: DEFAULT_READY_INTERVAL,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
            manager_url: None,
            wrapper_url: None,
        }
    }

    pub fn registry_file(&self) -> PathBuf {
        self.state_dir.join("registry")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("registry.lock.d")
    }

    pub fn cache_file(&self) -> PathBuf {
        self.state_dir.join("cache").join("manager")
    }

    pub fn services_dir(&self) -> PathBuf {
        self.state_dir.join("services")
    }

    pub fn state_file(&self, service: &str) -> Result<PathBuf> {
        crate::validate_name(service)?;
        Ok(self.services_dir().join(format!("{service}.state")))
    }

    pub fn port_file(&self, service: &str) -> Result<PathBuf> {
        crate::validate_name(service)?;
        Ok(self.services_dir().join(format!("{service}.port")))
    }

    pub fn log_file(&self, service: &str) -> Result<PathBuf> {
        crate::validate_name(service)?;
        Ok(self.log_dir.join(format!("{service}.log")))
    }

    pub fn manager_url(&self) -> Result<&str> {
        self.manager_url
            .as_deref()
            .ok_or_else(|| Error::Config("no manager source URL configured (SVCMGR_MANAGER_URL)".into()))
    }

    pub fn wrapper_url(&self) -> Result<&str> {
        self.wrapper_url
            .as_deref()
            .ok_or_else(|| Error::Config("no wrapper source URL configured (SVCMGR_WRAPPER_URL)".into()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_port == 0 {
            return Err(Error::Config("base port must be non-zero".into()));
        }
        if self.base_port.checked_add(self.port_range).is_none() {
            return Err(Error::Config(format!(
                "port range {}+{} exceeds 65535",
                self.base_port, self.port_range
            )));
        }
        if self.ready_attempts == 0 {
            return Err(Error::Config("readiness attempts must be at least 1".into()));
        }
        if self.ready_interval.is_zero() {
            return Err(Error::Config("readiness interval must be non-zero".into()));
        }
        if !self.probe_path.starts_with('/') {
            return Err(Error::Config(format!(
                "probe path '{}' must start with '/'",
                self.probe_path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_state_dir() {
        let config = Config::with_state_dir("/tmp/svc");
        assert_eq!(config.registry_file(), PathBuf::from("/tmp/svc/registry"));
        assert_eq!(config.lock_dir(), PathBuf::from("/tmp/svc/registry.lock.d"));
        assert_eq!(config.cache_file(), PathBuf::from("/tmp/svc/cache/manager"));
        assert_eq!(
            config.state_file("api").unwrap(),
            PathBuf::from("/tmp/svc/services/api.state")
        );
        assert_eq!(
            config.log_file("api").unwrap(),
            PathBuf::from("/tmp/svc/logs/api.log")
        );
    }

    #[test]
    fn per_service_paths_reject_traversal() {
        let config = Config::with_state_dir("/tmp/svc");
        assert!(config.state_file("../../etc/passwd").is_err());
        assert!(config.port_file("").is_err());
    }

    #[test]
    fn defaults() {
        let config = Config::with_state_dir("/tmp/svc");
        assert_eq!(config.base_port, 8080);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.ready_attempts, 20);
        assert_eq!(config.ready_interval, Duration::from_secs(5));
        assert!(config.lock_max_wait.is_none());
        assert!(config.lock_stale_after.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_overflowing_range() {
        let mut config = Config::with_state_dir("/tmp/svc");
        config.base_port = 65_500;
        config.port_range = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_ready_interval() {
        let mut config = Config::with_state_dir("/tmp/svc");
        config.ready_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
