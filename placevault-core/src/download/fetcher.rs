use std::{fmt, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ArchiveError, Result};

/// Retrieves raw snapshot bytes by URL.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpSnapshotFetcher {
    client: reqwest::Client,
}

impl fmt::Debug for HttpSnapshotFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSnapshotFetcher").finish_non_exhaustive()
    }
}

impl HttpSnapshotFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("placevault/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let expected_len = response.content_length();
        let bytes = response.bytes().await?;
        if let Some(content_len) = expected_len
            && bytes.len() as u64 != content_len
        {
            return Err(ArchiveError::Transport(format!(
                "snapshot size mismatch for {url}: got {} bytes, expected {content_len}",
                bytes.len()
            )));
        }
        debug!(%url, bytes = bytes.len(), "snapshot fetched");
        Ok(bytes.to_vec())
    }
}
