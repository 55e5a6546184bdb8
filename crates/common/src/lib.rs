pub mod config;
pub mod error;
pub mod version;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use config::Config;
pub use error::{Error, Result};
pub use version::VersionTag;

/// One line of the shared registry: a logical service name and the URL it is
/// currently reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub url: String,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Parse a `name=url` registry line. Splits on the first `=` only, so the
    /// URL may itself contain `=` (query strings).
    pub fn parse_line(line: &str) -> Option<Self> {
        let (name, url) = line.split_once('=')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, url))
    }

    pub fn to_line(&self) -> String {
        format!("{}={}", self.name, self.url)
    }
}

/// What the supervisor persisted about the instance it launched.
///
/// On disk this is two lines: the container identifier, then the pid of the
/// background log follower. The second line is empty while the follower has
/// not been spawned yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub container_id: String,
    pub log_follower_pid: Option<u32>,
}

impl InstanceState {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            log_follower_pid: None,
        }
    }

    pub fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let container_id = lines.next()?.trim();
        if container_id.is_empty() {
            return None;
        }
        let log_follower_pid = lines.next().and_then(|l| l.trim().parse::<u32>().ok());
        Some(Self {
            container_id: container_id.to_string(),
            log_follower_pid,
        })
    }

    pub fn to_file_contents(&self) -> String {
        match self.log_follower_pid {
            Some(pid) => format!("{}\n{}\n", self.container_id, pid),
            None => format!("{}\n\n", self.container_id),
        }
    }
}

/// Lifecycle of one supervised instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// A state file exists but the container behind it is not alive.
    Unknown,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Unknown, Starting)
                | (Unknown, Stopping)
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of a status query. `container_id` is the live id when running and
/// the stale id when the state file disagrees with the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub name: String,
    pub state: ServiceState,
    pub container_id: Option<String>,
    pub port: Option<u16>,
}

/// Reject names that cannot be stored as a registry key or used as a file
/// name under the state directory.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name cannot be empty")
    } else if name.contains('=') {
        Some("name cannot contain '='")
    } else if name.contains('\n') || name.contains('\r') {
        Some("name cannot contain a newline")
    } else if name.contains('/') || name.contains('\\') {
        Some("name cannot contain path separators")
    } else if name.starts_with('.') {
        Some("name cannot start with a dot")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

pub fn validate_url(url: &str) -> Result<()> {
    if url.contains('\n') || url.contains('\r') {
        return Err(Error::InvalidUrl {
            url: url.to_string(),
            reason: "cannot contain a newline".to_string(),
        });
    }
    Ok(())
}
