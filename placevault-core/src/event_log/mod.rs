//! Capacity-bounded ordered log of raw feed frames with live fanout.
//!
//! Appends are the single ordering point for ingestion. Fanout delivers each
//! appended frame at most once to receivers that are subscribed at append
//! time; anything a slow receiver misses must be recovered with
//! [`EventLog::read_after`].

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{FeedFrame, LoggedFrame, Sequence};

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryEventLog;
pub use redis_store::{DEFAULT_STREAM_KEY, RedisEventLog};

/// Historic retention bound for the frame log.
pub const DEFAULT_MAX_LEN: usize = 2_000_000;

/// Buffer depth of the in-process fanout channel.
pub const DEFAULT_FANOUT_CAPACITY: usize = 4_096;

#[async_trait]
pub trait EventLog: Send + Sync + fmt::Debug {
    /// Append a frame, evicting the oldest entries past the length bound.
    async fn append(&self, frame: FeedFrame) -> Result<Sequence>;

    /// Frames strictly after `after`, oldest first, at most `limit`.
    async fn read_after(&self, after: Sequence, limit: usize) -> Result<Vec<LoggedFrame>>;

    /// Number of retained frames.
    async fn len(&self) -> Result<usize>;

    /// Subscribe to frames appended from now on.
    fn fanout(&self) -> broadcast::Receiver<LoggedFrame>;
}
