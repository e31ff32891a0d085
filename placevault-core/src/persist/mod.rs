//! Conflict-free persistence of snapshot records and pixel history.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ArchiveError, Result};
use crate::types::{PixelRecord, SnapshotRecord};

pub mod memory;
pub mod persister;
pub mod postgres;

pub use memory::{InMemoryPixelHistory, InMemorySnapshotRepository};
pub use persister::Persister;
pub use postgres::{PostgresPixelHistory, PostgresSnapshotRepository};

/// Result of a conflict-free insert. A duplicate key is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

impl InsertOutcome {
    pub fn from_rows_affected(rows: u64) -> Self {
        if rows == 0 {
            InsertOutcome::AlreadyPresent
        } else {
            InsertOutcome::Inserted
        }
    }
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync + fmt::Debug {
    /// Insert keyed on url; an existing row is left untouched.
    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<InsertOutcome>;

    async fn snapshot_exists(&self, url: &str) -> Result<bool>;
}

#[async_trait]
pub trait PixelHistoryRepository: Send + Sync + fmt::Debug {
    /// Insert keyed on (partition, x, y, modified); an existing row is left untouched.
    async fn insert_pixel(&self, record: &PixelRecord) -> Result<InsertOutcome>;

    async fn count(&self) -> Result<u64>;
}

/// Upstream timestamps are milliseconds since the epoch.
pub fn timestamp_from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| ArchiveError::malformed(format!("timestamp {millis}ms is out of range")))
}
