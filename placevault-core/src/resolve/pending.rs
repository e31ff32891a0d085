use std::collections::{HashSet, VecDeque};
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connection::RedisHandle;
use crate::error::Result;
use crate::types::{ChangedCoordinate, CoordinateKey, PartitionId};

/// Default Redis set holding pending coordinates.
pub const DEFAULT_PENDING_KEY: &str = "queue:pixels";

/// Coordinates awaiting resolution, deduplicated by (partition, x, y) while
/// pending. A coordinate taken out may be added again later.
#[async_trait]
pub trait PendingCoordinates: Send + Sync + fmt::Debug {
    /// Add coordinates, returning how many were not already pending.
    async fn add(&self, coordinates: &[ChangedCoordinate]) -> Result<usize>;

    /// Remove and return up to `max` coordinates.
    async fn take(&self, max: usize) -> Result<Vec<ChangedCoordinate>>;

    async fn len(&self) -> Result<usize>;
}

#[derive(Default)]
struct PendingState {
    order: VecDeque<ChangedCoordinate>,
    keys: HashSet<CoordinateKey>,
}

/// FIFO pending set for single-process deployments.
#[derive(Default)]
pub struct InMemoryPendingCoordinates {
    state: Mutex<PendingState>,
}

impl fmt::Debug for InMemoryPendingCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPendingCoordinates")
            .field("pending", &self.state.lock().order.len())
            .finish()
    }
}

impl InMemoryPendingCoordinates {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingCoordinates for InMemoryPendingCoordinates {
    async fn add(&self, coordinates: &[ChangedCoordinate]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut added = 0;
        for coordinate in coordinates {
            if state.keys.insert(coordinate.key()) {
                state.order.push_back(*coordinate);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn take(&self, max: usize) -> Result<Vec<ChangedCoordinate>> {
        let mut state = self.state.lock();
        let n = max.min(state.order.len());
        let taken: Vec<ChangedCoordinate> = state.order.drain(..n).collect();
        for coordinate in &taken {
            state.keys.remove(&coordinate.key());
        }
        Ok(taken)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().order.len())
    }
}

/// Set member layout shared with other tooling reading the queue.
#[derive(Debug, Serialize, Deserialize)]
struct PendingMember {
    x: u32,
    y: u32,
    board: u32,
}

/// Redis set backed pending coordinates (`SADD` / `SPOP`).
#[derive(Clone)]
pub struct RedisPendingCoordinates {
    redis: RedisHandle,
    key: String,
}

impl fmt::Debug for RedisPendingCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisPendingCoordinates")
            .field("key", &self.key)
            .finish()
    }
}

impl RedisPendingCoordinates {
    pub fn new(redis: RedisHandle, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }
}

#[async_trait]
impl PendingCoordinates for RedisPendingCoordinates {
    async fn add(&self, coordinates: &[ChangedCoordinate]) -> Result<usize> {
        if coordinates.is_empty() {
            return Ok(0);
        }
        let members = coordinates
            .iter()
            .map(|c| {
                serde_json::to_string(&PendingMember {
                    x: c.x,
                    y: c.y,
                    board: c.partition.0,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut conn = self.redis.conn();
        let added: usize = redis::cmd("SADD")
            .arg(&self.key)
            .arg(members)
            .query_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn take(&self, max: usize) -> Result<Vec<ChangedCoordinate>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.conn();
        let members: Vec<String> = redis::cmd("SPOP")
            .arg(&self.key)
            .arg(max)
            .query_async(&mut conn)
            .await?;

        let now = Utc::now();
        let mut taken = Vec::with_capacity(members.len());
        for raw in members {
            match serde_json::from_str::<PendingMember>(&raw) {
                Ok(member) => taken.push(ChangedCoordinate {
                    partition: PartitionId(member.board),
                    x: member.x,
                    y: member.y,
                    discovered_at: now,
                }),
                Err(err) => warn!(key = %self.key, member = %raw, error = %err, "dropping unreadable pending member"),
            }
        }
        Ok(taken)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.redis.conn();
        let len: usize = redis::cmd("SCARD")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicates_are_ignored_while_pending() {
        let pending = InMemoryPendingCoordinates::new();
        let a = ChangedCoordinate::new(PartitionId(0), 1, 1);
        let b = ChangedCoordinate::new(PartitionId(1), 1, 1);
        assert_eq!(pending.add(&[a, b, a]).await.expect("add"), 2);
        assert_eq!(pending.add(&[a]).await.expect("add"), 0);
        assert_eq!(pending.len().await.expect("len"), 2);
    }

    #[tokio::test]
    async fn taken_coordinates_can_be_rediscovered() {
        let pending = InMemoryPendingCoordinates::new();
        let a = ChangedCoordinate::new(PartitionId(0), 5, 6);
        pending.add(&[a]).await.expect("add");
        let taken = pending.take(8).await.expect("take");
        assert_eq!(taken.len(), 1);
        assert_eq!(pending.add(&[a]).await.expect("add"), 1);
    }

    #[tokio::test]
    async fn take_is_fifo_and_bounded() {
        let pending = InMemoryPendingCoordinates::new();
        let coords: Vec<_> = (0..5)
            .map(|i| ChangedCoordinate::new(PartitionId(0), i, 0))
            .collect();
        pending.add(&coords).await.expect("add");
        let first = pending.take(3).await.expect("take");
        assert_eq!(first.iter().map(|c| c.x).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(pending.len().await.expect("len"), 2);
    }
}
