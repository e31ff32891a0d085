use std::{collections::BTreeMap, fmt, time::SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BlobEntry, BlobKey, BlobStore};
use crate::error::Result;

/// Keeps every version written, newest last.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<BTreeMap<BlobKey, Vec<(SystemTime, Vec<u8>)>>>,
}

impl fmt::Debug for InMemoryBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBlobStore")
            .field("keys", &self.blobs.lock().len())
            .finish()
    }
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BlobKey) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .and_then(|versions| versions.last())
            .map(|(_, bytes)| bytes.clone())
    }

    /// Total number of uploads across all keys.
    pub fn upload_count(&self) -> usize {
        self.blobs.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, key: &BlobKey, bytes: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .entry(key.clone())
            .or_default()
            .push((SystemTime::now(), bytes.to_vec()));
        Ok(())
    }

    async fn list(&self, prefix: &str, latest_only: bool) -> Result<Vec<BlobEntry>> {
        let blobs = self.blobs.lock();
        let mut entries = Vec::new();
        for (key, versions) in blobs.range(BlobKey::new(prefix)..) {
            if !key.as_str().starts_with(prefix) {
                break;
            }
            let selected: Box<dyn Iterator<Item = &(SystemTime, Vec<u8>)>> = if latest_only {
                Box::new(versions.last().into_iter())
            } else {
                Box::new(versions.iter())
            };
            entries.extend(selected.map(|(written_at, bytes)| BlobEntry {
                key: key.clone(),
                byte_len: bytes.len(),
                written_at: *written_at,
            }));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_only_collapses_versions() {
        let store = InMemoryBlobStore::new();
        let key = BlobKey::new("cdn/a.png");
        store.upload(&key, b"1").await.expect("upload");
        store.upload(&key, b"22").await.expect("upload");
        store.upload(&BlobKey::new("other/b.png"), b"3").await.expect("upload");

        let all = store.list("cdn/", false).await.expect("list");
        assert_eq!(all.len(), 2);
        let latest = store.list("cdn/", true).await.expect("list");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].byte_len, 2);
        assert_eq!(store.get(&key), Some(b"22".to_vec()));
    }
}
