use async_trait::async_trait;
use common::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Retrieves a payload from a remote location.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP(S) fetcher with a whole-request timeout. `file://` URLs are read
/// from disk, which covers sources on a shared mount.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("svcmgr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path).await.map_err(|e| Error::fetch(url, e));
        }

        debug!(url, "fetching");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e))?;

        if !resp.status().is_success() {
            return Err(Error::fetch(url, format!("HTTP {}", resp.status())));
        }

        let body = resp.bytes().await.map_err(|e| Error::fetch(url, e))?;
        Ok(body.to_vec())
    }
}
