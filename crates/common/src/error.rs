use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The lock directory stayed present for longer than the configured bound.
    /// A crashed holder leaves the directory behind; remove it manually or
    /// with `svcmgr unlock` once no other invocation is running.
    #[error("timed out after {}s waiting for lock {}", .waited.as_secs(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("no free port in range {base}..={}", .base.saturating_add(.range.to_owned()))]
    NoPortAvailable { base: u16, range: u16 },

    #[error("failed to launch container for '{service}': {reason}")]
    LaunchError { service: String, reason: String },

    #[error("'{service}' did not become ready at {url} after {attempts} attempts")]
    ReadinessTimeout {
        service: String,
        url: String,
        attempts: u32,
    },

    #[error("registry I/O error on {}: {source}", .path.display())]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to fetch {url}: {reason}")]
    FetchError { url: String, reason: String },

    #[error("self-update failed: {0}")]
    UpdateFailed(String),

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid version tag '{0}'")]
    InvalidVersion(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn registry_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::RegistryIo {
            path: path.into(),
            source,
        }
    }

    pub fn fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::FetchError {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code for this error kind. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::LockTimeout { .. } => 10,
            Error::NoPortAvailable { .. } => 11,
            Error::LaunchError { .. } => 12,
            Error::ReadinessTimeout { .. } => 13,
            Error::RegistryIo { .. } => 14,
            Error::FetchError { .. } => 15,
            Error::UpdateFailed(_) => 16,
            Error::InvalidName { .. }
            | Error::InvalidUrl { .. }
            | Error::InvalidVersion(_)
            | Error::Config(_) => 2,
            Error::Runtime(_) | Error::Io(_) => 1,
        }
    }

    /// True for the variant a leftover lock directory produces.
    pub fn is_lock_liveness_hazard(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
