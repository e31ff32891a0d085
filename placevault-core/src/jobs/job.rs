use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ArchiveError;
use crate::types::{ChangedCoordinate, PartitionId};

/// Unique identifier for scheduled jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    DownloadSnapshot,
    DiffSnapshot,
    ResolveBatch,
    ResolveSingle,
    PersistPixel,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::DownloadSnapshot,
        JobKind::DiffSnapshot,
        JobKind::ResolveBatch,
        JobKind::ResolveSingle,
        JobKind::PersistPixel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DownloadSnapshot => "download",
            JobKind::DiffSnapshot => "diff",
            JobKind::ResolveBatch => "resolve_batch",
            JobKind::ResolveSingle => "resolve_single",
            JobKind::PersistPixel => "persist",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ArchiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| ArchiveError::malformed(format!("unknown job kind `{raw}`")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSnapshotJob {
    pub partition: PartitionId,
    pub url: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSnapshotJob {
    pub partition: PartitionId,
    pub url: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl fmt::Debug for DiffSnapshotJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffSnapshotJob")
            .field("partition", &self.partition)
            .field("url", &self.url)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveBatchJob {
    pub coordinates: Vec<ChangedCoordinate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveSingleJob {
    pub coordinate: ChangedCoordinate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistPixelJob {
    pub partition: PartitionId,
    pub x: u32,
    pub y: u32,
    pub author: String,
    /// Milliseconds since the epoch, exactly as reported upstream.
    pub modified_ms: i64,
}

/// Structured payload per job kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum JobPayload {
    DownloadSnapshot(DownloadSnapshotJob),
    DiffSnapshot(DiffSnapshotJob),
    ResolveBatch(ResolveBatchJob),
    ResolveSingle(ResolveSingleJob),
    PersistPixel(PersistPixelJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::DownloadSnapshot(_) => JobKind::DownloadSnapshot,
            JobPayload::DiffSnapshot(_) => JobKind::DiffSnapshot,
            JobPayload::ResolveBatch(_) => JobKind::ResolveBatch,
            JobPayload::ResolveSingle(_) => JobKind::ResolveSingle,
            JobPayload::PersistPixel(_) => JobKind::PersistPixel,
        }
    }

    /// Short human-readable subject for log lines.
    pub fn subject(&self) -> String {
        match self {
            JobPayload::DownloadSnapshot(job) => job.url.clone(),
            JobPayload::DiffSnapshot(job) => job.url.clone(),
            JobPayload::ResolveBatch(job) => format!("{} coordinates", job.coordinates.len()),
            JobPayload::ResolveSingle(job) => {
                let c = job.coordinate;
                format!("{}:{},{}", c.partition, c.x, c.y)
            }
            JobPayload::PersistPixel(job) => {
                format!("{}:{},{}@{}", job.partition, job.x, job.y, job.modified_ms)
            }
        }
    }
}

/// Scheduler-visible job states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    Ready,
    Claimed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Claimed => "claimed",
        }
    }
}

/// Envelope held by the scheduler for each job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    /// Higher runs first.
    pub priority: i16,
    pub state: JobState,
    /// Failed executions that counted against `max_attempts`.
    pub attempts: u32,
    /// Lock-contention requeues, budgeted separately.
    pub contention_retries: u32,
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    /// Submission order, used to break priority ties.
    pub submitted_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(payload: JobPayload, priority: i16) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            priority,
            state: JobState::Ready,
            attempts: 0,
            contention_retries: 0,
            available_at: now,
            claimed_by: None,
            last_error: None,
            submitted_seq: 0,
            created_at: now,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_tagged_by_kind() {
        let payload = JobPayload::DownloadSnapshot(DownloadSnapshotJob {
            partition: PartitionId(3),
            url: "https://cdn.test/a.png".into(),
        });
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(
            value,
            json!({"kind": "DownloadSnapshot", "payload": {"partition": 3, "url": "https://cdn.test/a.png"}})
        );
    }

    #[test]
    fn snapshot_bytes_travel_as_base64() {
        let payload = JobPayload::DiffSnapshot(DiffSnapshotJob {
            partition: PartitionId(0),
            url: "u".into(),
            bytes: vec![0, 159, 146, 150],
        });
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["payload"]["bytes"], json!("AJ+Slg=="));
        let back: JobPayload = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, payload);
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().expect("known kind"), kind);
        }
        assert!("scan".parse::<JobKind>().is_err());
    }
}
