use std::{
    fmt,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tracing::debug;

use super::{BlobEntry, BlobKey, BlobStore};
use crate::error::{ArchiveError, Result};

/// Directory that `cacache` manages (index plus content-addressed data).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlobRoot(PathBuf);

impl BlobRoot {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for BlobRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlobRoot").field(&self.0).finish()
    }
}

/// A thin typed wrapper over `cacache` for snapshot blobs.
#[derive(Clone, Debug)]
pub struct CacacheBlobStore {
    root: BlobRoot,
}

impl CacacheBlobStore {
    pub fn new(root: BlobRoot) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &BlobRoot {
        &self.root
    }

    pub async fn read(&self, key: &BlobKey) -> Result<Vec<u8>> {
        cacache::read(self.root.as_path(), key.as_str())
            .await
            .map_err(|e| map_cacache_error(key, e))
    }
}

fn map_cacache_error(key: &BlobKey, err: cacache::Error) -> ArchiveError {
    match err {
        cacache::Error::EntryNotFound(_, _) => {
            ArchiveError::Blob(format!("blob not found: {key}"))
        }
        cacache::Error::IntegrityError(err) => {
            ArchiveError::Blob(format!("blob failed integrity check: {key} ({err})"))
        }
        cacache::Error::SizeMismatch(wanted, actual) => ArchiveError::Blob(format!(
            "blob size mismatch: key={key}, wanted={wanted}, actual={actual}"
        )),
        cacache::Error::IoError(_, msg) => ArchiveError::Blob(format!("blob I/O error: {msg}")),
        cacache::Error::SerdeError(_, msg) => {
            ArchiveError::Blob(format!("blob index serde error: {msg}"))
        }
    }
}

/// Index namespace holding one entry per write. Content is addressed by
/// hash, so a version entry shares its data with the current one.
const VERSION_PREFIX: &str = "versions/";

fn version_key(key: &BlobKey, written_at: SystemTime) -> String {
    let nanos = written_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{VERSION_PREFIX}{key}@{nanos:024}")
}

/// Splits a version key back into the blob key it was written under.
fn versioned_blob_key(raw: &str) -> Option<&str> {
    let rest = raw.strip_prefix(VERSION_PREFIX)?;
    rest.rsplit_once('@').map(|(key, _)| key)
}

#[async_trait]
impl BlobStore for CacacheBlobStore {
    async fn upload(&self, key: &BlobKey, bytes: &[u8]) -> Result<()> {
        let integrity = cacache::write(self.root.as_path(), key.as_str(), bytes)
            .await
            .map_err(|e| map_cacache_error(key, e))?;
        cacache::write(self.root.as_path(), version_key(key, SystemTime::now()), bytes)
            .await
            .map_err(|e| map_cacache_error(key, e))?;
        debug!(%key, %integrity, bytes = bytes.len(), "snapshot blob stored");
        Ok(())
    }

    async fn list(&self, prefix: &str, latest_only: bool) -> Result<Vec<BlobEntry>> {
        // The cacache index collapses to the newest entry per key, so history
        // comes from the version namespace.
        let root = self.root.as_path().to_path_buf();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for meta in cacache::list_sync(&root) {
                let meta = meta.map_err(|e| ArchiveError::Blob(format!("blob list failed: {e}")))?;
                let key = match versioned_blob_key(&meta.key) {
                    Some(key) if !latest_only => key,
                    Some(_) => continue,
                    None if latest_only && !meta.key.starts_with(VERSION_PREFIX) => {
                        meta.key.as_str()
                    }
                    None => continue,
                };
                if !key.starts_with(&prefix) {
                    continue;
                }
                let millis = u64::try_from(meta.time).unwrap_or(u64::MAX);
                entries.push(BlobEntry {
                    key: BlobKey::new(key),
                    byte_len: meta.size,
                    written_at: UNIX_EPOCH + Duration::from_millis(millis),
                });
            }
            entries.sort_by(|a, b| a.key.cmp(&b.key).then(a.written_at.cmp(&b.written_at)));
            Ok(entries)
        })
        .await
        .map_err(|e| ArchiveError::Internal(format!("blob list task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_overwrites_and_lists_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacacheBlobStore::new(BlobRoot::new(dir.path().to_path_buf()));

        let a = BlobKey::from_url("https://cdn.test/frames/0/a.png");
        let b = BlobKey::from_url("https://cdn.test/frames/1/b.png");
        store.upload(&a, b"first").await.expect("upload a");
        store.upload(&a, b"second").await.expect("overwrite a");
        store.upload(&b, b"other").await.expect("upload b");

        assert_eq!(store.read(&a).await.expect("read a"), b"second".to_vec());

        let listed = store.list("cdn.test/frames/0/", true).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, a);
        assert_eq!(listed[0].byte_len, 6);
    }

    #[tokio::test]
    async fn full_listing_keeps_every_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacacheBlobStore::new(BlobRoot::new(dir.path().to_path_buf()));

        let a = BlobKey::from_url("https://cdn.test/frames/0/a.png");
        store.upload(&a, b"1").await.expect("upload");
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.upload(&a, b"22").await.expect("upload");
        store
            .upload(&BlobKey::from_url("https://cdn.test/other/b.png"), b"333")
            .await
            .expect("upload");

        let all = store.list("cdn.test/frames/", false).await.expect("list");
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|entry| entry.key == a));
        assert_eq!(
            all.iter().map(|entry| entry.byte_len).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let latest = store.list("cdn.test/frames/", true).await.expect("list");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].byte_len, 2);

        let everything = store.list("", true).await.expect("list");
        assert_eq!(everything.len(), 2);
        assert!(everything.iter().all(|entry| !entry.key.as_str().starts_with("versions/")));
    }
}
