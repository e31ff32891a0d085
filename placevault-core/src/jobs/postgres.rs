use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tracing::{debug, warn};
use uuid::Uuid;

use super::events::{JobEvent, JobEventBus};
use super::job::{JobId, JobKind, JobPayload, JobRecord, JobState};
use super::memory::{CLAIM_EXPIRED, DEFAULT_CLAIM_TTL, publish_failure};
use super::policy::{JobPolicyTable, RetryDecision};
use super::queue::{FailOutcome, KindCounts, QueueSnapshot, TaskScheduler};
use crate::error::{ArchiveError, Result};

/// Durable scheduler over the `archive_jobs` table. Multiple processes may
/// claim concurrently; `FOR UPDATE SKIP LOCKED` keeps claims disjoint.
pub struct PostgresTaskScheduler {
    pool: PgPool,
    policies: JobPolicyTable,
    events: JobEventBus,
    claim_ttl: Duration,
    poll_interval: Duration,
    dead_lettered: Mutex<HashMap<JobKind, u64>>,
}

impl fmt::Debug for PostgresTaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTaskScheduler")
            .field("pool_size", &self.pool.size())
            .field("claim_ttl", &self.claim_ttl)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl PostgresTaskScheduler {
    pub fn new(pool: PgPool, policies: JobPolicyTable, events: JobEventBus) -> Self {
        Self {
            pool,
            policies,
            events,
            claim_ttl: DEFAULT_CLAIM_TTL,
            poll_interval: Duration::from_millis(250),
            dead_lettered: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn decode_row(row: &PgRow) -> Result<JobRecord> {
        let id: Uuid = row.try_get("id")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let payload: JobPayload = serde_json::from_value(payload)?;
        let priority: i16 = row.try_get("priority")?;
        let attempts: i32 = row.try_get("attempts")?;
        let contention_retries: i32 = row.try_get("contention_retries")?;
        let available_at: DateTime<Utc> = row.try_get("available_at")?;
        let claimed_by: Option<String> = row.try_get("claimed_by")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let submitted_seq: i64 = row.try_get("submitted_seq")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(JobRecord {
            id: JobId(id),
            payload,
            priority,
            state: JobState::Claimed,
            attempts: attempts.max(0) as u32,
            contention_retries: contention_retries.max(0) as u32,
            available_at,
            claimed_by,
            last_error,
            submitted_seq: submitted_seq.max(0) as u64,
            created_at,
        })
    }

    /// Returns false when `job` no longer holds its claim.
    async fn requeue(
        &self,
        job: &JobRecord,
        attempts: u32,
        contention_retries: u32,
        delay: Duration,
        error: &ArchiveError,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE archive_jobs
            SET state = 'ready',
                attempts = $2,
                contention_retries = $3,
                available_at = NOW() + ($4::BIGINT * INTERVAL '1 millisecond'),
                claimed_by = NULL,
                claim_expires_at = NULL,
                last_error = $5,
                updated_at = NOW()
            WHERE id = $1
              AND state = 'claimed'
              AND claimed_by IS NOT DISTINCT FROM $6
            "#,
        )
        .bind(job.id.0)
        .bind(attempts as i32)
        .bind(contention_retries as i32)
        .bind(delay.as_millis() as i64)
        .bind(error.to_string())
        .bind(job.claimed_by.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete `job` if it still holds its claim.
    async fn remove_claimed(&self, job: &JobRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM archive_jobs
            WHERE id = $1
              AND state = 'claimed'
              AND claimed_by IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(job.id.0)
        .bind(job.claimed_by.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM archive_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete expired claims of `kind` whose expiry would exhaust the budget.
    async fn dead_letter_expired(
        tx: &mut Transaction<'_, Postgres>,
        kind: JobKind,
        max_attempts: u32,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM archive_jobs
            WHERE state = 'claimed'
              AND claim_expires_at < NOW()
              AND kind = $1
              AND attempts + 1 >= $2
            RETURNING id, payload, priority, attempts + 1 AS attempts, contention_retries,
                      available_at, claimed_by, last_error, submitted_seq, created_at
            "#,
        )
        .bind(kind.as_str())
        .bind(max_attempts as i32)
        .fetch_all(&mut **tx)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::decode_row(row) {
                Ok(job) => jobs.push(job),
                Err(err) => warn!(%kind, error = %err, "dead-lettered an undecodable job row"),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl TaskScheduler for PostgresTaskScheduler {
    async fn submit(&self, payload: JobPayload) -> Result<JobId> {
        let kind = payload.kind();
        let priority = self.policies.for_kind(kind).priority;
        let id = JobId::new();
        let body = serde_json::to_value(&payload)?;

        sqlx::query(
            r#"
            INSERT INTO archive_jobs (id, kind, payload, priority, state, available_at)
            VALUES ($1, $2, $3, $4, 'ready', NOW())
            "#,
        )
        .bind(id.0)
        .bind(kind.as_str())
        .bind(body)
        .bind(priority)
        .execute(&self.pool)
        .await?;

        self.events.publish(JobEvent::Submitted { job_id: id, kind });
        Ok(id)
    }

    async fn try_claim(&self, worker: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE archive_jobs
            SET state = 'claimed',
                claimed_by = $1,
                claim_expires_at = NOW() + ($2::BIGINT * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM archive_jobs
                WHERE state = 'ready'
                  AND available_at <= NOW()
                ORDER BY priority DESC, submitted_seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, priority, attempts, contention_retries,
                      available_at, claimed_by, last_error, submitted_seq, created_at
            "#,
        )
        .bind(worker)
        .bind(self.claim_ttl.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        match Self::decode_row(&row) {
            Ok(job) => {
                self.events.publish(JobEvent::Claimed {
                    job_id: job.id,
                    kind: job.kind(),
                    worker: worker.to_string(),
                });
                Ok(Some(job))
            }
            Err(err) => {
                // A row we cannot decode would be claimed forever; remove it.
                let id: Option<Uuid> = row.try_get("id").ok();
                warn!(?id, error = %err, "discarding undecodable job row");
                if let Some(id) = id {
                    self.remove(JobId(id)).await?;
                }
                Ok(None)
            }
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        if !self.remove_claimed(job).await? {
            debug!(job = %job.id, "completed job was no longer held by this claim");
        }
        self.events.publish(JobEvent::Completed {
            job_id: job.id,
            kind: job.kind(),
        });
        Ok(())
    }

    async fn fail(&self, job: &JobRecord, error: &ArchiveError) -> Result<FailOutcome> {
        let kind = job.kind();
        let class = error.class();
        let (held, outcome) = match self.policies.for_kind(kind).decide(job, class) {
            RetryDecision::Retry { attempt, delay } => {
                let held = self
                    .requeue(job, attempt, job.contention_retries, delay, error)
                    .await?;
                (held, FailOutcome::Retrying { attempt, delay })
            }
            RetryDecision::Requeue { delay } => {
                let held = self
                    .requeue(job, job.attempts, job.contention_retries + 1, delay, error)
                    .await?;
                (held, FailOutcome::Requeued { delay })
            }
            RetryDecision::Terminal { attempts } => {
                let held = self.remove_claimed(job).await?;
                if held {
                    *self.dead_lettered.lock().entry(kind).or_default() += 1;
                }
                (held, FailOutcome::DeadLettered { attempts })
            }
            RetryDecision::Drop => (self.remove_claimed(job).await?, FailOutcome::Dropped),
        };

        let outcome = if held { outcome } else { FailOutcome::ClaimLost };
        publish_failure(&self.events, job, class, error, outcome);
        Ok(outcome)
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        // NOW() is fixed for the transaction, so both statements see the same expiries.
        let mut tx = self.pool.begin().await?;
        let mut exhausted = Vec::new();
        for kind in JobKind::ALL {
            let max_attempts = self.policies.for_kind(kind).max_attempts;
            exhausted.extend(Self::dead_letter_expired(&mut tx, kind, max_attempts).await?);
        }

        let result = sqlx::query(
            r#"
            UPDATE archive_jobs
            SET state = 'ready',
                attempts = attempts + 1,
                claimed_by = NULL,
                claim_expires_at = NULL,
                last_error = $1,
                updated_at = NOW()
            WHERE state = 'claimed'
              AND claim_expires_at < NOW()
            "#,
        )
        .bind(CLAIM_EXPIRED)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let error = ArchiveError::Transport(CLAIM_EXPIRED.into());
        for job in &exhausted {
            *self.dead_lettered.lock().entry(job.kind()).or_default() += 1;
            publish_failure(
                &self.events,
                job,
                error.class(),
                &error,
                FailOutcome::DeadLettered {
                    attempts: job.attempts,
                },
            );
        }

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(reclaimed, "returned expired claims to the ready queue");
        } else {
            debug!("no expired claims");
        }
        Ok(reclaimed + exhausted.len() as u64)
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT kind,
                   COUNT(*) FILTER (WHERE state = 'ready' AND available_at <= NOW()) AS ready,
                   COUNT(*) FILTER (WHERE state = 'ready' AND available_at > NOW()) AS deferred,
                   COUNT(*) FILTER (WHERE state = 'claimed') AS claimed
            FROM archive_jobs
            GROUP BY kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let dead = self.dead_lettered.lock().clone();
        let mut snapshot = QueueSnapshot::default();
        for kind in JobKind::ALL {
            snapshot.kinds.insert(
                kind.as_str().to_string(),
                KindCounts {
                    dead_lettered: dead.get(&kind).copied().unwrap_or(0),
                    ..KindCounts::default()
                },
            );
        }
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let counts = snapshot.kinds.entry(kind).or_default();
            counts.ready = row.try_get::<i64, _>("ready")?.max(0) as u64;
            counts.deferred = row.try_get::<i64, _>("deferred")?.max(0) as u64;
            counts.claimed = row.try_get::<i64, _>("claimed")?.max(0) as u64;
        }
        Ok(snapshot)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{DownloadSnapshotJob, PersistPixelJob};
    use crate::types::PartitionId;

    fn scheduler(pool: PgPool) -> PostgresTaskScheduler {
        PostgresTaskScheduler::new(pool, JobPolicyTable::default(), JobEventBus::default())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn claims_follow_priority_and_are_exclusive(pool: PgPool) {
        let scheduler = scheduler(pool);
        let download = scheduler
            .submit(JobPayload::DownloadSnapshot(DownloadSnapshotJob {
                partition: PartitionId(1),
                url: "https://cdn.test/a.png".into(),
            }))
            .await
            .expect("submit download");
        let persist = scheduler
            .submit(JobPayload::PersistPixel(PersistPixelJob {
                partition: PartitionId(1),
                x: 4,
                y: 5,
                author: "someone".into(),
                modified_ms: 1_649_000_000_000,
            }))
            .await
            .expect("submit persist");

        let first = scheduler.try_claim("w1").await.expect("claim").expect("job");
        let second = scheduler.try_claim("w2").await.expect("claim").expect("job");
        assert_eq!(first.id, persist);
        assert_eq!(second.id, download);
        assert!(scheduler.try_claim("w3").await.expect("claim").is_none());

        scheduler.complete(&first).await.expect("complete");
        let outcome = scheduler
            .fail(
                &second,
                &ArchiveError::HttpStatus {
                    status: 502,
                    url: "https://cdn.test/a.png".into(),
                },
            )
            .await
            .expect("fail");
        assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));

        let snapshot = scheduler.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.counts(JobKind::DownloadSnapshot).deferred, 1);
        assert_eq!(snapshot.counts(JobKind::PersistPixel), KindCounts::default());
    }

    fn download(url: &str) -> JobPayload {
        JobPayload::DownloadSnapshot(DownloadSnapshotJob {
            partition: PartitionId(1),
            url: url.into(),
        })
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn expired_claims_count_toward_the_attempt_budget(pool: PgPool) {
        let events = JobEventBus::default();
        let mut rx = events.subscribe();
        let mut table = JobPolicyTable::default();
        table.for_kind_mut(JobKind::DownloadSnapshot).max_attempts = 2;
        let scheduler = PostgresTaskScheduler::new(pool, table, events)
            .with_claim_ttl(Duration::from_millis(10));
        let id = scheduler
            .submit(download("https://cdn.test/a.png"))
            .await
            .expect("submit");

        scheduler.try_claim("w1").await.expect("claim").expect("job");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.reclaim_expired().await.expect("reclaim"), 1);
        let snapshot = scheduler.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.counts(JobKind::DownloadSnapshot).ready, 1);

        let again = scheduler.try_claim("w2").await.expect("claim").expect("job");
        assert_eq!(again.attempts, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.reclaim_expired().await.expect("reclaim"), 1);

        let snapshot = scheduler.snapshot().await.expect("snapshot");
        let counts = snapshot.counts(JobKind::DownloadSnapshot);
        assert_eq!(counts.ready + counts.deferred + counts.claimed, 0);
        assert_eq!(counts.dead_lettered, 1);

        let mut saw_terminal = false;
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::DeadLettered { job_id, attempts, .. } = event {
                assert_eq!(job_id, id);
                assert_eq!(attempts, 2);
                saw_terminal = true;
            }
        }
        assert!(saw_terminal);
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_claim_cannot_requeue_or_remove(pool: PgPool) {
        let scheduler = scheduler(pool).with_claim_ttl(Duration::from_millis(10));
        scheduler
            .submit(download("https://cdn.test/b.png"))
            .await
            .expect("submit");

        let stale = scheduler.try_claim("w1").await.expect("claim").expect("job");
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.reclaim_expired().await.expect("reclaim");
        let current = scheduler.try_claim("w2").await.expect("claim").expect("job");
        assert_eq!(current.id, stale.id);

        let outcome = scheduler
            .fail(
                &stale,
                &ArchiveError::HttpStatus {
                    status: 502,
                    url: "https://cdn.test/b.png".into(),
                },
            )
            .await
            .expect("fail");
        assert_eq!(outcome, FailOutcome::ClaimLost);
        let outcome = scheduler
            .fail(&stale, &ArchiveError::malformed("bad png"))
            .await
            .expect("fail");
        assert_eq!(outcome, FailOutcome::ClaimLost);

        let snapshot = scheduler.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.counts(JobKind::DownloadSnapshot).claimed, 1);
    }
}
