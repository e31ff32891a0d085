//! Snapshot blob storage.

use std::{fmt, time::SystemTime};

use async_trait::async_trait;

use crate::error::Result;

pub mod cacache_store;
pub mod memory;

pub use cacache_store::{BlobRoot, CacacheBlobStore};
pub use memory::InMemoryBlobStore;

/// Storage key for a snapshot: its URL with the scheme stripped.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_url(url: &str) -> Self {
        let stripped = url.split_once("://").map_or(url, |(_, rest)| rest);
        Self(stripped.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlobKey").field(&self.0).finish()
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: BlobKey,
    pub byte_len: usize,
    pub written_at: SystemTime,
}

#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Store `bytes` under `key`, replacing any previous content.
    async fn upload(&self, key: &BlobKey, bytes: &[u8]) -> Result<()>;

    /// Entries whose key starts with `prefix`, sorted by key. With
    /// `latest_only` each key appears once, at its most recent write.
    async fn list(&self, prefix: &str, latest_only: bool) -> Result<Vec<BlobEntry>>;
}

#[cfg(test)]
mod tests {
    use super::BlobKey;

    #[test]
    fn key_strips_scheme_only() {
        let key = BlobKey::from_url("https://hot-potato.example/media/canvas-frame/0/1.png");
        assert_eq!(key.as_str(), "hot-potato.example/media/canvas-frame/0/1.png");
        assert_eq!(BlobKey::from_url("no-scheme/x.png").as_str(), "no-scheme/x.png");
    }
}
