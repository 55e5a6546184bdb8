//! TTL-gated store for the most recently fetched manager payload.
//!
//! A payload fetched at `t` is valid while `now - t < ttl`; at exactly the
//! TTL it is already expired.

use common::{Error, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

pub trait PayloadCache: Send + Sync {
    fn get(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the cached payload wholesale and reset its fetch time.
    fn put(&self, payload: &[u8]) -> Result<()>;

    fn fetched_at(&self) -> Option<SystemTime>;

    /// Where the payload can be executed from, if it lives on disk.
    fn location(&self) -> Option<&Path> {
        None
    }

    fn age_at(&self, now: SystemTime) -> Option<Duration> {
        let fetched = self.fetched_at()?;
        Some(now.duration_since(fetched).unwrap_or(Duration::ZERO))
    }

    fn age(&self) -> Option<Duration> {
        self.age_at(SystemTime::now())
    }

    fn is_valid_at(&self, ttl: Duration, now: SystemTime) -> bool {
        self.age_at(now).is_some_and(|age| age < ttl)
    }

    fn is_valid(&self, ttl: Duration) -> bool {
        self.is_valid_at(ttl, SystemTime::now())
    }
}

/// Cache file whose modification time is the fetch time.
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PayloadCache for FileCache {
    fn get(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, payload: &[u8]) -> Result<()> {
        write_executable(&self.path, payload)
    }

    fn fetched_at(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn location(&self) -> Option<&Path> {
        Some(self.path.as_path())
    }
}

/// Write `payload` to a sibling temp file, mark it executable and rename it
/// over `path`. Either the old or the new content is visible, never a mix.
pub fn write_executable(path: &Path, payload: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(payload)?;
        file.sync_all()?;
        drop(file);
        set_executable(&tmp)?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::Io(e)
    })
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entry: Mutex<Option<(Vec<u8>, SystemTime)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate or forward-date the entry.
    pub fn set_fetched_at(&self, at: SystemTime) {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, fetched)) = entry.as_mut() {
            *fetched = at;
        }
    }
}

impl PayloadCache for MemoryCache {
    fn get(&self) -> Result<Option<Vec<u8>>> {
        let entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entry.as_ref().map(|(payload, _)| payload.clone()))
    }

    fn put(&self, payload: &[u8]) -> Result<()> {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        *entry = Some((payload.to_vec(), SystemTime::now()));
        Ok(())
    }

    fn fetched_at(&self) -> Option<SystemTime> {
        let entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.as_ref().map(|(_, at)| *at)
    }
}
