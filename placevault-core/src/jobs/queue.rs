use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::job::{JobId, JobKind, JobPayload, JobRecord};
use crate::error::{ArchiveError, Result};

/// What the scheduler did with a failed job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    Requeued { delay: Duration },
    DeadLettered { attempts: u32 },
    Dropped,
    /// The claim expired and was handed elsewhere before the failure was
    /// recorded; the job was left to its current holder.
    ClaimLost,
}

/// Per-kind queue depths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub ready: u64,
    pub deferred: u64,
    pub claimed: u64,
    /// Terminal failures since this process started.
    pub dead_lettered: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub kinds: BTreeMap<String, KindCounts>,
}

impl QueueSnapshot {
    pub fn counts(&self, kind: JobKind) -> KindCounts {
        self.kinds.get(kind.as_str()).copied().unwrap_or_default()
    }

    pub fn total_pending(&self) -> u64 {
        self.kinds
            .values()
            .map(|c| c.ready + c.deferred + c.claimed)
            .sum()
    }
}

/// Priority-ordered, retrying, at-least-once job queue.
///
/// Selection: among jobs whose eligible time has passed, the highest numeric
/// priority wins; ties go to the earliest submission.
#[async_trait]
pub trait TaskScheduler: Send + Sync + fmt::Debug {
    /// Enqueue with the kind's default priority.
    async fn submit(&self, payload: JobPayload) -> Result<JobId>;

    /// Claim the best ready job without waiting.
    async fn try_claim(&self, worker: &str) -> Result<Option<JobRecord>>;

    /// Suspend until a job is ready or `shutdown` fires.
    async fn claim(
        &self,
        worker: &str,
        shutdown: &CancellationToken,
    ) -> Result<Option<JobRecord>> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.try_claim(worker).await? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }

    /// Remove a successfully executed job.
    async fn complete(&self, job: &JobRecord) -> Result<()>;

    /// Apply the kind's retry policy to a failed job.
    async fn fail(&self, job: &JobRecord, error: &ArchiveError) -> Result<FailOutcome>;

    /// Return claims whose holder stopped responding to the ready state.
    /// An expiry counts as an attempt; jobs that exhaust their budget this
    /// way are dead-lettered instead. Returns the number of expired claims.
    async fn reclaim_expired(&self) -> Result<u64>;

    async fn snapshot(&self) -> Result<QueueSnapshot>;

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(250)
    }
}
