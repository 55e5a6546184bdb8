use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Config, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const OWNER_FILE: &str = "owner";

/// What to do with a lock directory whose holder appears to have died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    /// Wait for the holder no matter how old the lock is.
    Never,
    /// Break a lock whose directory is older than the given age.
    After(Duration),
}

/// Mutual exclusion between invocations of the tool.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn acquire(&self) -> Result<LockGuard>;
}

/// Held lock. Released on drop, or explicitly via [`LockGuard::release`] to
/// observe the error.
#[derive(Debug)]
pub struct LockGuard {
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    Dir(PathBuf),
    Memory(OwnedMutexGuard<()>),
    Released,
}

impl LockGuard {
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.inner, GuardInner::Released) {
            GuardInner::Dir(path) => match fs::remove_dir_all(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(path = %path.display(), "lock directory vanished while held");
                    Ok(())
                }
                Err(e) => Err(Error::registry_io(path, e)),
            },
            GuardInner::Memory(_) | GuardInner::Released => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("failed to release lock: {}", e);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Lock represented by the presence of a directory. `mkdir` is atomic, so
/// exactly one process wins when several race for it.
#[derive(Debug, Clone)]
pub struct DirLock {
    path: PathBuf,
    retry_interval: Duration,
    max_wait: Option<Duration>,
    stale: StalePolicy,
}

impl DirLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry_interval: common::config::DEFAULT_LOCK_RETRY,
            max_wait: None,
            stale: StalePolicy::Never,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.lock_dir())
            .with_retry_interval(config.lock_retry_interval)
            .with_max_wait(config.lock_max_wait)
            .with_stale_policy(match config.lock_stale_after {
                Some(age) => StalePolicy::After(age),
                None => StalePolicy::Never,
            })
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_stale_policy(mut self, stale: StalePolicy) -> Self {
        self.stale = stale;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One attempt at creating the lock directory.
    fn try_create(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::registry_io(parent, e))?;
        }

        match fs::create_dir(&self.path) {
            Ok(()) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                // The owner file is diagnostic only; the directory is the lock.
                if let Ok(json) = serde_json::to_string(&owner) {
                    let _ = fs::write(self.path.join(OWNER_FILE), json);
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::registry_io(&self.path, e)),
        }
    }

    pub fn owner(&self) -> Option<LockOwner> {
        let contents = fs::read_to_string(self.path.join(OWNER_FILE)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Age of the lock directory, from its modification time.
    pub fn age(&self) -> Option<Duration> {
        dir_age(&self.path)
    }

    fn is_stale(&self) -> bool {
        self.older_than_limit(&self.path)
    }

    fn older_than_limit(&self, path: &Path) -> bool {
        match self.stale {
            StalePolicy::Never => false,
            StalePolicy::After(limit) => dir_age(path).is_some_and(|age| age > limit),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Break the lock if it is still stale. Breakers take turns through a
    /// sibling `.break` directory and re-check the age while holding it, so
    /// a lock re-created after an earlier staleness check is left alone.
    /// Returns whether a lock was removed.
    fn break_stale(&self) -> Result<bool> {
        let marker = self.sibling("break");
        match fs::create_dir(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // A breaker that died mid-break leaves its marker behind.
                if self.older_than_limit(&marker) {
                    warn!(path = %marker.display(), "removing abandoned lock break marker");
                    let _ = fs::remove_dir(&marker);
                }
                return Ok(false);
            }
            Err(e) => return Err(Error::registry_io(&marker, e)),
        }

        let broken = self.break_while_marked();
        if let Err(e) = fs::remove_dir(&marker) {
            warn!(path = %marker.display(), "failed to remove lock break marker: {}", e);
        }
        broken
    }

    fn break_while_marked(&self) -> Result<bool> {
        if !self.is_stale() {
            return Ok(false);
        }
        let owner = self.owner();
        let aside = self.sibling(&format!("stale.{}", std::process::id()));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {
                warn!(
                    path = %self.path.display(),
                    owner = ?owner,
                    "breaking stale registry lock"
                );
                let _ = fs::remove_dir_all(&aside);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::registry_io(&self.path, e)),
        }
    }

    /// Remove the lock directory regardless of who holds it.
    pub fn force_release(&self) -> Result<bool> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::registry_io(&self.path, e)),
        }
    }
}

fn dir_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[async_trait]
impl LockBackend for DirLock {
    async fn acquire(&self) -> Result<LockGuard> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if self.try_create()? {
                debug!(path = %self.path.display(), "acquired registry lock");
                return Ok(LockGuard {
                    inner: GuardInner::Dir(self.path.clone()),
                });
            }

            if self.is_stale() && self.break_stale()? {
                continue;
            }

            if let Some(max_wait) = self.max_wait {
                if started.elapsed() >= max_wait {
                    return Err(Error::LockTimeout {
                        path: self.path.clone(),
                        waited: started.elapsed(),
                    });
                }
            }

            if !announced {
                info!(
                    path = %self.path.display(),
                    owner = ?self.owner(),
                    "registry lock is held, waiting"
                );
                announced = true;
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// In-process lock for single-binary deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    inner: Arc<Mutex<()>>,
    max_wait: Option<Duration>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }
}

#[async_trait]
impl LockBackend for MemoryLock {
    async fn acquire(&self) -> Result<LockGuard> {
        let guard = match self.max_wait {
            None => self.inner.clone().lock_owned().await,
            Some(max_wait) => tokio::time::timeout(max_wait, self.inner.clone().lock_owned())
                .await
                .map_err(|_| Error::LockTimeout {
                    path: PathBuf::from("<memory>"),
                    waited: max_wait,
                })?,
        };
        Ok(LockGuard {
            inner: GuardInner::Memory(guard),
        })
    }
}
