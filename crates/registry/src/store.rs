use crate::lock::{DirLock, LockBackend};
use async_trait::async_trait;
use common::{validate_name, validate_url, Config, Error, Result, ServiceRecord};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Mapping of logical service names to reachable URLs.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Insert or overwrite the record for `name`.
    async fn register(&self, name: &str, url: &str) -> Result<()>;
    /// Drop the record for `name`. Returns whether one existed.
    async fn remove(&self, name: &str) -> Result<bool>;
    async fn find(&self, name: &str) -> Result<Option<String>>;
    async fn list(&self) -> Result<Vec<ServiceRecord>>;
}

/// Registry backed by a newline-delimited `name=url` file. Writers hold the
/// lock for the whole read-modify-replace cycle; readers do not lock since
/// the file is only ever swapped in by rename.
pub struct FileRegistry {
    path: PathBuf,
    lock: Arc<dyn LockBackend>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>, lock: Arc<dyn LockBackend>) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.registry_file(), Arc::new(DirLock::from_config(config)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `edit` to the current record set under the lock and write the
    /// result back atomically.
    async fn mutate<F, T>(&self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<ServiceRecord>) -> T + Send,
        T: Send,
    {
        let guard = self.lock.acquire().await?;
        let mut records = load_records(&self.path)?;
        let out = edit(&mut records);
        save_records(&self.path, &records)?;
        guard.release()?;
        Ok(out)
    }
}

#[async_trait]
impl RegistryStore for FileRegistry {
    async fn register(&self, name: &str, url: &str) -> Result<()> {
        validate_name(name)?;
        validate_url(url)?;
        let record = ServiceRecord::new(name, url);
        self.mutate(move |records| {
            records.retain(|r| r.name != record.name);
            records.push(record);
        })
        .await?;
        info!(service = name, url, "registered service");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let removed = self
            .mutate(|records| {
                let before = records.len();
                records.retain(|r| r.name != name);
                records.len() != before
            })
            .await?;
        if removed {
            info!(service = name, "removed service from registry");
        } else {
            debug!(service = name, "no registry entry to remove");
        }
        Ok(removed)
    }

    async fn find(&self, name: &str) -> Result<Option<String>> {
        validate_name(name)?;
        Ok(load_records(&self.path)?
            .into_iter()
            .find(|r| r.name == name)
            .map(|r| r.url))
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>> {
        load_records(&self.path)
    }
}

/// Read all records. A missing file is an empty registry; malformed lines
/// are skipped.
pub fn load_records(path: &Path) -> Result<Vec<ServiceRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::registry_io(path, e)),
    };

    Ok(contents
        .lines()
        .filter_map(ServiceRecord::parse_line)
        .collect())
}

/// Replace the registry file with `records` via a temp file and rename, so
/// lock-free readers never see a half-written file.
pub fn save_records(path: &Path, records: &[ServiceRecord]) -> Result<()> {
    let io_err = |e| Error::registry_io(path, e);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut body = String::new();
    for record in records {
        body.push_str(&record.to_line());
        body.push('\n');
    }

    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(e)
    })
}

/// In-memory registry for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<Vec<ServiceRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    async fn register(&self, name: &str, url: &str) -> Result<()> {
        validate_name(name)?;
        validate_url(url)?;
        let mut records = self.records.write().await;
        records.retain(|r| r.name != name);
        records.push(ServiceRecord::new(name, url));
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.name != name);
        Ok(records.len() != before)
    }

    async fn find(&self, name: &str) -> Result<Option<String>> {
        validate_name(name)?;
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.name == name).map(|r| r.url.clone()))
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.records.read().await.clone())
    }
}
