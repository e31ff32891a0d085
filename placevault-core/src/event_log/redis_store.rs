use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::streams::{StreamId, StreamRangeReply};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{DEFAULT_FANOUT_CAPACITY, EventLog};
use crate::connection::RedisHandle;
use crate::error::{ArchiveError, Result};
use crate::types::{FeedChannel, FeedFrame, FrameKind, LoggedFrame, Sequence};

/// Stream key and pub/sub channel used for raw frames.
pub const DEFAULT_STREAM_KEY: &str = "socket:snakebin";

/// Redis stream backed log. `XADD MAXLEN` enforces the bound exactly, the
/// stream id doubles as the sequence, and every append is also published on
/// a channel of the same name for out-of-process listeners.
pub struct RedisEventLog {
    redis: RedisHandle,
    stream_key: String,
    max_len: usize,
    sender: broadcast::Sender<LoggedFrame>,
}

impl fmt::Debug for RedisEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventLog")
            .field("stream_key", &self.stream_key)
            .field("max_len", &self.max_len)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl RedisEventLog {
    pub fn new(redis: RedisHandle, stream_key: impl Into<String>, max_len: usize) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_FANOUT_CAPACITY);
        Self {
            redis,
            stream_key: stream_key.into(),
            max_len: max_len.max(1),
            sender,
        }
    }

    fn decode_entry(entry: &StreamId) -> Result<LoggedFrame> {
        let sequence: Sequence = entry.id.parse()?;
        let payload: Vec<u8> = entry
            .get("message")
            .ok_or_else(|| ArchiveError::malformed(format!("stream entry {} has no message", entry.id)))?;
        let kind = entry
            .get::<String>("type")
            .as_deref()
            .unwrap_or("text")
            .parse::<FrameKind>()?;
        let channel = match entry.get::<String>("channel") {
            Some(raw) => raw.parse::<FeedChannel>()?,
            None => FeedChannel::Configuration,
        };
        let received_at = entry
            .get::<i64>("received_at")
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(|| {
                DateTime::<Utc>::from_timestamp_millis(sequence.millis as i64)
                    .unwrap_or_default()
            });

        Ok(LoggedFrame {
            sequence,
            frame: FeedFrame {
                channel,
                kind,
                payload,
                received_at,
            },
        })
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append(&self, frame: FeedFrame) -> Result<Sequence> {
        let mut conn = self.redis.conn();

        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("MAXLEN")
            .arg(self.max_len)
            .arg("*")
            .arg("message")
            .arg(frame.payload.as_slice())
            .arg("type")
            .arg(frame.kind.as_str())
            .arg("channel")
            .arg(frame.channel.to_string())
            .arg("received_at")
            .arg(frame.received_at.timestamp_millis())
            .query_async(&mut conn)
            .await?;

        if let Err(err) = redis::cmd("PUBLISH")
            .arg(&self.stream_key)
            .arg(frame.payload.as_slice())
            .query_async::<i64>(&mut conn)
            .await
        {
            warn!(stream = %self.stream_key, error = %err, "publish after append failed");
        }

        let sequence: Sequence = id.parse()?;
        debug!(stream = %self.stream_key, %sequence, channel = %frame.channel, "frame appended");
        let _ = self.sender.send(LoggedFrame { sequence, frame });
        Ok(sequence)
    }

    async fn read_after(&self, after: Sequence, limit: usize) -> Result<Vec<LoggedFrame>> {
        let mut conn = self.redis.conn();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(format!("({after}"))
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let mut frames = Vec::with_capacity(reply.ids.len());
        for entry in &reply.ids {
            match Self::decode_entry(entry) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    warn!(stream = %self.stream_key, id = %entry.id, error = %err, "skipping undecodable stream entry")
                }
            }
        }
        Ok(frames)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.redis.conn();
        let len: usize = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    fn fanout(&self) -> broadcast::Receiver<LoggedFrame> {
        self.sender.subscribe()
    }
}
