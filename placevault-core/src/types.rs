//! Shared value types that flow between the pipeline stages.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

/// Subscription id used for the configuration channel.
pub const CONFIG_SUBSCRIPTION_ID: &str = "1";

/// Canvas subscriptions are numbered from this offset upward.
pub const CANVAS_SUBSCRIPTION_OFFSET: u32 = 2;

/// An independently addressed grid instance within the canvas.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub fn subscription_id(self) -> String {
        (self.0 + CANVAS_SUBSCRIPTION_OFFSET).to_string()
    }

    /// Fallback inference from a subscription id. Clamped at zero.
    pub fn from_subscription_id(id: u32) -> Self {
        Self(id.saturating_sub(CANVAS_SUBSCRIPTION_OFFSET))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which upstream channel a frame arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FeedChannel {
    Configuration,
    Canvas(PartitionId),
}

impl FeedChannel {
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            FeedChannel::Configuration => None,
            FeedChannel::Canvas(partition) => Some(*partition),
        }
    }

    pub fn subscription_id(&self) -> String {
        match self {
            FeedChannel::Configuration => CONFIG_SUBSCRIPTION_ID.to_string(),
            FeedChannel::Canvas(partition) => partition.subscription_id(),
        }
    }
}

impl fmt::Display for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedChannel::Configuration => f.write_str("config"),
            FeedChannel::Canvas(partition) => write!(f, "canvas:{partition}"),
        }
    }
}

impl FromStr for FeedChannel {
    type Err = ArchiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw == "config" {
            return Ok(FeedChannel::Configuration);
        }
        raw.strip_prefix("canvas:")
            .and_then(|id| id.parse::<u32>().ok())
            .map(|id| FeedChannel::Canvas(PartitionId(id)))
            .ok_or_else(|| ArchiveError::malformed(format!("unknown feed channel `{raw}`")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Text,
    Binary,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Text => "text",
            FrameKind::Binary => "binary",
        }
    }
}

impl FromStr for FrameKind {
    type Err = ArchiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "text" => Ok(FrameKind::Text),
            "binary" => Ok(FrameKind::Binary),
            other => Err(ArchiveError::malformed(format!("unknown frame kind `{other}`"))),
        }
    }
}

/// Log-assigned position, ordered the same way as Redis stream ids
/// (`<millis>-<seq>`).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Sequence {
    pub millis: u64,
    pub seq: u64,
}

impl Sequence {
    pub const ZERO: Sequence = Sequence { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id strictly greater than `self` at the given clock reading.
    pub fn next_after(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for Sequence {
    type Err = ArchiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = raw.split_once('-').unwrap_or((raw, "0"));
        let millis = millis
            .parse()
            .map_err(|_| ArchiveError::malformed(format!("bad sequence `{raw}`")))?;
        let seq = seq
            .parse()
            .map_err(|_| ArchiveError::malformed(format!("bad sequence `{raw}`")))?;
        Ok(Self { millis, seq })
    }
}

/// A raw frame as received from the live feed.
#[derive(Clone, PartialEq, Eq)]
pub struct FeedFrame {
    pub channel: FeedChannel,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl FeedFrame {
    pub fn text(channel: FeedChannel, payload: impl Into<String>) -> Self {
        Self {
            channel,
            kind: FrameKind::Text,
            payload: payload.into().into_bytes(),
            received_at: Utc::now(),
        }
    }

    pub fn partition(&self) -> Option<PartitionId> {
        self.channel.partition()
    }
}

impl fmt::Debug for FeedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedFrame")
            .field("channel", &self.channel)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .field("received_at", &self.received_at)
            .finish()
    }
}

/// A frame after the event log has taken ownership of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedFrame {
    pub sequence: Sequence,
    pub frame: FeedFrame,
}

/// Identity used to deduplicate pending coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordinateKey {
    pub partition: PartitionId,
    pub x: u32,
    pub y: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedCoordinate {
    pub partition: PartitionId,
    pub x: u32,
    pub y: u32,
    pub discovered_at: DateTime<Utc>,
}

impl ChangedCoordinate {
    pub fn new(partition: PartitionId, x: u32, y: u32) -> Self {
        Self {
            partition,
            x,
            y,
            discovered_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CoordinateKey {
        CoordinateKey {
            partition: self.partition,
            x: self.x,
            y: self.y,
        }
    }
}

/// Write-once record of a downloaded snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub size: i64,
}

/// One authored change of a single coordinate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRecord {
    pub partition: PartitionId,
    pub x: u32,
    pub y: u32,
    pub modified: DateTime<Utc>,
    pub author: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_orders_like_stream_ids() {
        let a: Sequence = "1700000000000-5".parse().expect("valid id");
        let b: Sequence = "1700000000001-0".parse().expect("valid id");
        assert!(a < b);
        assert_eq!(a.to_string(), "1700000000000-5");
        assert_eq!(a.next_after(1_699_999_999_000), Sequence::new(1_700_000_000_000, 6));
        assert_eq!(a.next_after(1_700_000_000_002), Sequence::new(1_700_000_000_002, 0));
    }

    #[test]
    fn subscription_ids_are_offset_from_partitions() {
        assert_eq!(PartitionId(0).subscription_id(), "2");
        assert_eq!(PartitionId::from_subscription_id(5), PartitionId(3));
        assert_eq!(PartitionId::from_subscription_id(1), PartitionId(0));
    }

    #[test]
    fn channel_round_trips_through_text() {
        for channel in [FeedChannel::Configuration, FeedChannel::Canvas(PartitionId(7))] {
            let parsed: FeedChannel = channel.to_string().parse().expect("channel parses");
            assert_eq!(parsed, channel);
        }
        assert!("canvas:x".parse::<FeedChannel>().is_err());
    }
}
