//! Version negotiation for the wrapper script and the cached manager payload.
//!
//! [`resolve`] decides what to do from versions and cache state alone; the
//! controller performs the I/O it asks for.

use crate::cache::{write_executable, PayloadCache};
use crate::fetch::Fetcher;
use common::version::{read_marker, read_marker_from_file};
use common::{Config, Error, Result, VersionTag};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on the passive update check that precedes `run_manager`.
pub const UPDATE_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    UseCached,
    Refetch,
    WarnOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// The cached copy exists and is younger than the TTL.
    pub cache_valid: bool,
    /// Replace the cached copy when the remote one is newer, instead of
    /// only warning about it. The wrapper check never sets it: replacing
    /// the running script takes an explicit `update-self`.
    pub auto_refresh: bool,
}

pub fn resolve(
    local: Option<&VersionTag>,
    remote: Option<&VersionTag>,
    policy: CachePolicy,
) -> Action {
    if !policy.cache_valid {
        return Action::Refetch;
    }
    match (local, remote) {
        (Some(local), Some(remote)) if remote.is_newer_than(local) => {
            if policy.auto_refresh {
                Action::Refetch
            } else {
                Action::WarnOnly
            }
        }
        _ => Action::UseCached,
    }
}

/// Non-fatal notice that the wrapper is behind its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotice {
    pub local: VersionTag,
    pub remote: VersionTag,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub refreshed: bool,
    pub version: Option<VersionTag>,
    pub location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub old: Option<VersionTag>,
    pub new: Option<VersionTag>,
}

pub struct SelfUpdateController {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<dyn PayloadCache>,
    cache_ttl: Duration,
    manager_url: Option<String>,
    wrapper_url: Option<String>,
    update_command: String,
    script: Option<PathBuf>,
    check_timeout: Duration,
}

impl SelfUpdateController {
    pub fn new(config: &Config, fetcher: Arc<dyn Fetcher>, cache: Arc<dyn PayloadCache>) -> Self {
        Self {
            fetcher,
            cache,
            cache_ttl: config.cache_ttl,
            manager_url: config.manager_url.clone(),
            wrapper_url: config.wrapper_url.clone(),
            update_command: "svcmgr update-self".to_string(),
            script: None,
            check_timeout: UPDATE_CHECK_TIMEOUT,
        }
    }

    /// Wrapper script whose marker `run_manager` checks against its source.
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    fn cached_version(&self) -> Result<Option<VersionTag>> {
        Ok(self
            .cache
            .get()?
            .and_then(|payload| read_marker(&String::from_utf8_lossy(&payload))))
    }

    /// Compare the script's own marker with its source. Never fails: any
    /// problem only suppresses the notice.
    pub async fn check_self_update(&self, script: &Path) -> Option<UpdateNotice> {
        let local = match read_marker_from_file(script) {
            Ok(Some(tag)) => tag,
            Ok(None) => {
                debug!(script = %script.display(), "no version marker, skipping update check");
                return None;
            }
            Err(e) => {
                debug!(script = %script.display(), "cannot read script for update check: {}", e);
                return None;
            }
        };

        let url = self.wrapper_url.as_deref()?;
        let remote = match self.fetcher.fetch(url).await {
            Ok(body) => read_marker(&String::from_utf8_lossy(&body))?,
            Err(e) => {
                debug!("update check skipped: {}", e);
                return None;
            }
        };

        let policy = CachePolicy {
            cache_valid: true,
            auto_refresh: false,
        };
        match resolve(Some(&local), Some(&remote), policy) {
            Action::WarnOnly => {
                warn!(
                    local = %local,
                    remote = %remote,
                    command = %self.update_command,
                    "a newer version is available"
                );
                Some(UpdateNotice {
                    local,
                    remote,
                    command: self.update_command.clone(),
                })
            }
            _ => None,
        }
    }

    /// Make sure the cached manager payload is younger than the TTL,
    /// refetching it if not. With an expired copy on hand a failed refetch
    /// only warns and keeps the old payload.
    ///
    /// The remote version is only learned by fetching, so while the cache is
    /// fresh the resolver has nothing newer to compare against and keeps it.
    pub async fn ensure_latest_manager(&self) -> Result<ManagerStatus> {
        let policy = CachePolicy {
            cache_valid: self.cache.is_valid(self.cache_ttl),
            auto_refresh: false,
        };
        let cached = self.cached_version()?;

        let refreshed = match resolve(cached.as_ref(), None, policy) {
            Action::Refetch => {
                let url = self.manager_url.as_deref().ok_or_else(|| {
                    Error::Config("no manager source URL configured (SVCMGR_MANAGER_URL)".into())
                })?;
                match self.fetcher.fetch(url).await {
                    Ok(payload) => {
                        self.cache.put(&payload)?;
                        info!(url, bytes = payload.len(), "refreshed cached manager");
                        true
                    }
                    Err(e) => {
                        if self.cache.get()?.is_none() {
                            return Err(e);
                        }
                        warn!("using expired cached manager: {}", e);
                        false
                    }
                }
            }
            Action::UseCached | Action::WarnOnly => {
                debug!("cached manager is fresh");
                false
            }
        };

        let version = if refreshed { self.cached_version()? } else { cached };
        Ok(ManagerStatus {
            refreshed,
            version,
            location: self.cache.location().map(Path::to_path_buf),
        })
    }

    /// Replace `script` with a fresh copy from its source. Any failure
    /// leaves the existing file untouched.
    pub async fn update_self(&self, script: &Path) -> Result<UpdateReport> {
        let url = self
            .wrapper_url
            .as_deref()
            .ok_or_else(|| Error::UpdateFailed("no wrapper source URL configured".into()))?;

        let old = read_marker_from_file(script).ok().flatten();
        let payload = self
            .fetcher
            .fetch(url)
            .await
            .map_err(|e| Error::UpdateFailed(e.to_string()))?;
        if payload.is_empty() {
            return Err(Error::UpdateFailed(format!("{url} returned an empty payload")));
        }

        let new = read_marker(&String::from_utf8_lossy(&payload));
        write_executable(script, &payload).map_err(|e| {
            Error::UpdateFailed(format!("cannot replace {}: {}", script.display(), e))
        })?;

        info!(
            old = ?old.as_ref().map(ToString::to_string),
            new = ?new.as_ref().map(ToString::to_string),
            "updated {}",
            script.display()
        );
        Ok(UpdateReport { old, new })
    }

    /// Warn if the wrapper is behind, refresh the manager if needed, then
    /// run it with `args` and return its exit code. The update check is
    /// bounded by the check timeout and never fails the run.
    pub async fn run_manager(&self, args: &[String]) -> Result<i32> {
        if let Some(script) = &self.script {
            if tokio::time::timeout(self.check_timeout, self.check_self_update(script))
                .await
                .is_err()
            {
                debug!("update check timed out");
            }
        }

        let status = self.ensure_latest_manager().await?;
        let program = status
            .location
            .ok_or_else(|| Error::Config("cached manager has no location on disk".into()))?;

        let exit = tokio::process::Command::new(&program)
            .args(args)
            .status()
            .await
            .map_err(|e| Error::Runtime(format!("failed to run {}: {}", program.display(), e)))?;
        Ok(exit.code().unwrap_or(1))
    }
}
