//! Retrying, priority-ordered job execution.

pub mod events;
pub mod job;
pub mod memory;
pub mod policy;
pub mod postgres;
pub mod queue;
pub mod worker;

pub use events::{JobEvent, JobEventBus};
pub use job::{
    DiffSnapshotJob, DownloadSnapshotJob, JobId, JobKind, JobPayload, JobRecord, JobState,
    PersistPixelJob, ResolveBatchJob, ResolveSingleJob,
};
pub use memory::InMemoryTaskScheduler;
pub use policy::{JobPolicy, JobPolicyTable, RetryDecision};
pub use postgres::PostgresTaskScheduler;
pub use queue::{FailOutcome, KindCounts, QueueSnapshot, TaskScheduler};
pub use worker::{JobHandler, WorkerPool};
