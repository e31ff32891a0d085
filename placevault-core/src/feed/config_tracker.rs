//! Highest partition index announced on the configuration channel.
//!
//! The ceiling only ever grows. It is persisted so a restarted process can
//! resubscribe to every known partition before the first configuration
//! message arrives.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::connection::RedisHandle;
use crate::error::Result;
use crate::types::PartitionId;

pub const DEFAULT_META_KEY: &str = "place:meta";
pub const META_INDEX_FIELD: &str = "index";

#[async_trait]
pub trait CeilingStore: Send + Sync + fmt::Debug {
    async fn load(&self) -> Result<Option<PartitionId>>;

    async fn store(&self, ceiling: PartitionId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCeilingStore {
    value: Mutex<Option<PartitionId>>,
}

impl InMemoryCeilingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ceiling(ceiling: PartitionId) -> Self {
        Self {
            value: Mutex::new(Some(ceiling)),
        }
    }
}

#[async_trait]
impl CeilingStore for InMemoryCeilingStore {
    async fn load(&self) -> Result<Option<PartitionId>> {
        Ok(*self.value.lock())
    }

    async fn store(&self, ceiling: PartitionId) -> Result<()> {
        *self.value.lock() = Some(ceiling);
        Ok(())
    }
}

/// Ceiling kept in a Redis hash field (`place:meta` / `index`).
#[derive(Clone)]
pub struct RedisCeilingStore {
    redis: RedisHandle,
    key: String,
}

impl fmt::Debug for RedisCeilingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCeilingStore")
            .field("key", &self.key)
            .finish()
    }
}

impl RedisCeilingStore {
    pub fn new(redis: RedisHandle, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }
}

#[async_trait]
impl CeilingStore for RedisCeilingStore {
    async fn load(&self) -> Result<Option<PartitionId>> {
        let mut conn = self.redis.conn();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.key)
            .arg(META_INDEX_FIELD)
            .query_async(&mut conn)
            .await?;
        Ok(match raw {
            Some(raw) => match raw.parse::<u32>() {
                Ok(index) => Some(PartitionId(index)),
                Err(_) => {
                    warn!(key = %self.key, value = %raw, "ignoring unreadable partition ceiling");
                    None
                }
            },
            None => None,
        })
    }

    async fn store(&self, ceiling: PartitionId) -> Result<()> {
        let mut conn = self.redis.conn();
        let _: i64 = redis::cmd("HSET")
            .arg(&self.key)
            .arg(META_INDEX_FIELD)
            .arg(ceiling.0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Shared handle; clones observe the same ceiling.
#[derive(Clone)]
pub struct ConfigTracker {
    sender: Arc<watch::Sender<Option<PartitionId>>>,
    store: Arc<dyn CeilingStore>,
    /// Serializes persist-then-raise so stored values never go backwards.
    publishing: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for ConfigTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigTracker")
            .field("ceiling", &self.current())
            .field("store", &self.store)
            .finish()
    }
}

impl ConfigTracker {
    pub fn new(store: Arc<dyn CeilingStore>) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
            store,
            publishing: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Load the persisted ceiling, if any, without writing it back.
    pub async fn seed(&self) -> Result<Option<PartitionId>> {
        if let Some(ceiling) = self.store.load().await? {
            self.raise(ceiling);
            info!(ceiling = %ceiling, "seeded partition ceiling");
        }
        Ok(self.current())
    }

    /// Record an announced maximum index. Returns whether the ceiling rose.
    /// Subscribers only see a ceiling once it has been persisted; if the
    /// store fails nothing changes and the announcement can be replayed.
    pub async fn publish(&self, max_index: PartitionId) -> Result<bool> {
        let _guard = self.publishing.lock().await;
        if self.current().is_some_and(|current| current >= max_index) {
            return Ok(false);
        }
        self.store.store(max_index).await?;
        let raised = self.raise(max_index);
        if raised {
            info!(ceiling = %max_index, "partition ceiling raised");
        }
        Ok(raised)
    }

    fn raise(&self, candidate: PartitionId) -> bool {
        self.sender.send_if_modified(|current| match current {
            Some(existing) if *existing >= candidate => false,
            _ => {
                *current = Some(candidate);
                true
            }
        })
    }

    pub fn current(&self) -> Option<PartitionId> {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PartitionId>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ceiling_never_decreases() {
        let store = Arc::new(InMemoryCeilingStore::new());
        let tracker = ConfigTracker::new(store.clone());
        assert_eq!(tracker.current(), None);

        assert!(tracker.publish(PartitionId(3)).await.expect("publish"));
        assert!(!tracker.publish(PartitionId(1)).await.expect("publish"));
        assert!(!tracker.publish(PartitionId(3)).await.expect("publish"));
        assert_eq!(tracker.current(), Some(PartitionId(3)));
        assert_eq!(store.load().await.expect("load"), Some(PartitionId(3)));
    }

    #[tokio::test]
    async fn seed_restores_persisted_ceiling_and_notifies() {
        let store = Arc::new(InMemoryCeilingStore::with_ceiling(PartitionId(5)));
        let tracker = ConfigTracker::new(store);
        let mut rx = tracker.subscribe();

        assert_eq!(tracker.seed().await.expect("seed"), Some(PartitionId(5)));
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), Some(PartitionId(5)));
    }

    #[derive(Debug, Default)]
    struct UnavailableStore {
        fail: std::sync::atomic::AtomicBool,
        inner: InMemoryCeilingStore,
    }

    #[async_trait]
    impl CeilingStore for UnavailableStore {
        async fn load(&self) -> Result<Option<PartitionId>> {
            self.inner.load().await
        }

        async fn store(&self, ceiling: PartitionId) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::error::ArchiveError::Transport("store unavailable".into()));
            }
            self.inner.store(ceiling).await
        }
    }

    #[tokio::test]
    async fn failed_persist_leaves_ceiling_unchanged_for_replay() {
        let store = Arc::new(UnavailableStore::default());
        store.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let tracker = ConfigTracker::new(store.clone());
        let rx = tracker.subscribe();

        tracker.publish(PartitionId(4)).await.expect_err("store is down");
        assert_eq!(tracker.current(), None);
        assert!(!rx.has_changed().expect("sender alive"));

        store.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(tracker.publish(PartitionId(4)).await.expect("publish"));
        assert_eq!(tracker.current(), Some(PartitionId(4)));
        assert_eq!(store.load().await.expect("load"), Some(PartitionId(4)));
    }
}
