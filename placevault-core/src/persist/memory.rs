use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{InsertOutcome, PixelHistoryRepository, SnapshotRepository};
use crate::error::Result;
use crate::types::{PartitionId, PixelRecord, SnapshotRecord};

#[derive(Default)]
pub struct InMemorySnapshotRepository {
    rows: Mutex<HashMap<String, SnapshotRecord>>,
}

impl fmt::Debug for InMemorySnapshotRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySnapshotRepository")
            .field("rows", &self.rows.lock().len())
            .finish()
    }
}

impl InMemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, url: &str) -> Option<SnapshotRecord> {
        self.rows.lock().get(url).cloned()
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<InsertOutcome> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&record.url) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        rows.insert(record.url.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn snapshot_exists(&self, url: &str) -> Result<bool> {
        Ok(self.rows.lock().contains_key(url))
    }
}

type PixelKey = (PartitionId, u32, u32, DateTime<Utc>);

#[derive(Default)]
pub struct InMemoryPixelHistory {
    rows: Mutex<BTreeMap<PixelKey, String>>,
}

impl fmt::Debug for InMemoryPixelHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPixelHistory")
            .field("rows", &self.rows.lock().len())
            .finish()
    }
}

impl InMemoryPixelHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PixelRecord> {
        self.rows
            .lock()
            .iter()
            .map(|((partition, x, y, modified), author)| PixelRecord {
                partition: *partition,
                x: *x,
                y: *y,
                modified: *modified,
                author: author.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl PixelHistoryRepository for InMemoryPixelHistory {
    async fn insert_pixel(&self, record: &PixelRecord) -> Result<InsertOutcome> {
        let key = (record.partition, record.x, record.y, record.modified);
        let mut rows = self.rows.lock();
        if rows.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        rows.insert(key, record.author.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::timestamp_from_millis;

    fn pixel(author: &str) -> PixelRecord {
        PixelRecord {
            partition: PartitionId(1),
            x: 10,
            y: 20,
            modified: timestamp_from_millis(1_649_000_000_123).expect("ts"),
            author: author.to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_pixel_key_keeps_first_row() {
        let repo = InMemoryPixelHistory::new();
        assert_eq!(repo.insert_pixel(&pixel("alice")).await.expect("insert"), InsertOutcome::Inserted);
        assert_eq!(
            repo.insert_pixel(&pixel("mallory")).await.expect("insert"),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(repo.count().await.expect("count"), 1);
        assert_eq!(repo.records()[0].author, "alice");
    }

    #[tokio::test]
    async fn same_coordinate_at_later_time_is_new_history() {
        let repo = InMemoryPixelHistory::new();
        let first = pixel("alice");
        let mut later = first.clone();
        later.modified = timestamp_from_millis(1_649_000_001_000).expect("ts");
        repo.insert_pixel(&first).await.expect("insert");
        repo.insert_pixel(&later).await.expect("insert");
        assert_eq!(repo.count().await.expect("count"), 2);
    }
}
