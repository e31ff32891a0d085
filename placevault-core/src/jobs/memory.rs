use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{JobEvent, JobEventBus};
use super::job::{JobId, JobKind, JobPayload, JobRecord, JobState};
use super::policy::{JobPolicyTable, RetryDecision};
use super::queue::{FailOutcome, KindCounts, QueueSnapshot, TaskScheduler};
use crate::error::{ArchiveError, Result};

pub(crate) const CLAIM_EXPIRED: &str = "claim expired";

/// Default time a claim stays valid before housekeeping returns it.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(600);

struct Entry {
    record: JobRecord,
    ready_at: Instant,
    claim_expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
    dead_lettered: HashMap<JobKind, u64>,
}

/// Single-process scheduler. Time follows the tokio clock.
pub struct InMemoryTaskScheduler {
    state: Mutex<State>,
    notify: Notify,
    policies: JobPolicyTable,
    events: JobEventBus,
    claim_ttl: Duration,
}

impl fmt::Debug for InMemoryTaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTaskScheduler")
            .field("jobs", &self.state.lock().jobs.len())
            .field("claim_ttl", &self.claim_ttl)
            .finish_non_exhaustive()
    }
}

impl InMemoryTaskScheduler {
    pub fn new(policies: JobPolicyTable, events: JobEventBus) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            policies,
            events,
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the best eligible job, or report when the next one becomes ready.
    fn claim_now(&self, worker: &str) -> std::result::Result<JobRecord, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut best: Option<(JobId, i16, u64)> = None;
        let mut earliest: Option<Instant> = None;
        for (id, entry) in &state.jobs {
            if entry.record.state != JobState::Ready {
                continue;
            }
            if entry.ready_at > now {
                earliest = Some(earliest.map_or(entry.ready_at, |e| e.min(entry.ready_at)));
                continue;
            }
            let candidate = (*id, entry.record.priority, entry.record.submitted_seq);
            best = match best {
                Some(current)
                    if (current.1, std::cmp::Reverse(current.2))
                        >= (candidate.1, std::cmp::Reverse(candidate.2)) =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }

        let Some((id, _, _)) = best else {
            return Err(earliest);
        };
        let claim_ttl = self.claim_ttl;
        let entry = state.jobs.get_mut(&id).ok_or(earliest)?;
        entry.record.state = JobState::Claimed;
        entry.record.claimed_by = Some(worker.to_string());
        entry.claim_expires_at = Some(now + claim_ttl);
        Ok(entry.record.clone())
    }
}

#[async_trait]
impl TaskScheduler for InMemoryTaskScheduler {
    async fn submit(&self, payload: JobPayload) -> Result<JobId> {
        let kind = payload.kind();
        let policy = self.policies.for_kind(kind);
        let mut record = JobRecord::new(payload, policy.priority);
        let id = record.id;
        {
            let mut state = self.state.lock();
            state.next_seq += 1;
            record.submitted_seq = state.next_seq;
            state.jobs.insert(
                id,
                Entry {
                    record,
                    ready_at: Instant::now(),
                    claim_expires_at: None,
                },
            );
        }
        self.notify.notify_one();
        self.events.publish(JobEvent::Submitted { job_id: id, kind });
        Ok(id)
    }

    async fn try_claim(&self, worker: &str) -> Result<Option<JobRecord>> {
        match self.claim_now(worker) {
            Ok(job) => {
                self.events.publish(JobEvent::Claimed {
                    job_id: job.id,
                    kind: job.kind(),
                    worker: worker.to_string(),
                });
                Ok(Some(job))
            }
            Err(_) => Ok(None),
        }
    }

    async fn claim(
        &self,
        worker: &str,
        shutdown: &CancellationToken,
    ) -> Result<Option<JobRecord>> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.claim_now(worker) {
                Ok(job) => {
                    self.events.publish(JobEvent::Claimed {
                        job_id: job.id,
                        kind: job.kind(),
                        worker: worker.to_string(),
                    });
                    return Ok(Some(job));
                }
                Err(earliest) => earliest.unwrap_or_else(|| Instant::now() + Duration::from_secs(1)),
            };

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            let held = state
                .jobs
                .get(&job.id)
                .is_some_and(|entry| holds_claim(&entry.record, job));
            if held {
                state.jobs.remove(&job.id)
            } else {
                None
            }
        };
        if removed.is_none() {
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
        let current = {
            let state = self.state.lock();
            state.jobs.get(&job.id).map(|entry| entry.record.clone())
        };
        let Some(current) = current else {
            warn!(job = %job.id, %kind, "failed job was no longer tracked");
            return Ok(FailOutcome::Dropped);
        };
        if !holds_claim(&current, job) {
            publish_failure(&self.events, job, class, error, FailOutcome::ClaimLost);
            return Ok(FailOutcome::ClaimLost);
        }

        let decision = self.policies.for_kind(kind).decide(&current, class);
        let outcome = {
            let mut state = self.state.lock();
            match decision {
                RetryDecision::Retry { attempt, delay } => {
                    if let Some(entry) = state.jobs.get_mut(&job.id) {
                        entry.record.attempts = attempt;
                        entry.record.last_error = Some(error.to_string());
                        requeue(entry, delay);
                    }
                    FailOutcome::Retrying { attempt, delay }
                }
                RetryDecision::Requeue { delay } => {
                    if let Some(entry) = state.jobs.get_mut(&job.id) {
                        entry.record.contention_retries += 1;
                        requeue(entry, delay);
                    }
                    FailOutcome::Requeued { delay }
                }
                RetryDecision::Terminal { attempts } => {
                    state.jobs.remove(&job.id);
                    *state.dead_lettered.entry(kind).or_default() += 1;
                    FailOutcome::DeadLettered { attempts }
                }
                RetryDecision::Drop => {
                    state.jobs.remove(&job.id);
                    FailOutcome::Dropped
                }
            }
        };

        publish_failure(&self.events, job, class, error, outcome);
        if matches!(outcome, FailOutcome::Retrying { .. } | FailOutcome::Requeued { .. }) {
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut requeued = 0u64;
        let mut exhausted = Vec::new();
        {
            let mut state = self.state.lock();
            let expired: Vec<JobId> = state
                .jobs
                .iter()
                .filter(|(_, entry)| {
                    entry.record.state == JobState::Claimed
                        && entry.claim_expires_at.is_some_and(|at| at <= now)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in expired {
                let Some(entry) = state.jobs.get_mut(&id) else {
                    continue;
                };
                let kind = entry.record.kind();
                let attempts = entry.record.attempts.saturating_add(1);
                entry.record.attempts = attempts;
                entry.record.last_error = Some(CLAIM_EXPIRED.into());
                if attempts >= self.policies.for_kind(kind).max_attempts {
                    if let Some(entry) = state.jobs.remove(&id) {
                        *state.dead_lettered.entry(kind).or_default() += 1;
                        exhausted.push(entry.record);
                    }
                } else {
                    requeue(entry, Duration::ZERO);
                    requeued += 1;
                }
            }
        }

        let error = ArchiveError::Transport(CLAIM_EXPIRED.into());
        for job in &exhausted {
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
        if requeued > 0 {
            warn!(reclaimed = requeued, "returned expired claims to the ready queue");
            self.notify.notify_waiters();
        }
        Ok(requeued + exhausted.len() as u64)
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::default();
        for kind in JobKind::ALL {
            snapshot.kinds.insert(
                kind.as_str().to_string(),
                KindCounts {
                    dead_lettered: state.dead_lettered.get(&kind).copied().unwrap_or(0),
                    ..KindCounts::default()
                },
            );
        }
        for entry in state.jobs.values() {
            let counts = snapshot
                .kinds
                .entry(entry.record.kind().as_str().to_string())
                .or_default();
            match entry.record.state {
                JobState::Claimed => counts.claimed += 1,
                JobState::Ready if entry.ready_at > now => counts.deferred += 1,
                JobState::Ready => counts.ready += 1,
            }
        }
        Ok(snapshot)
    }
}

fn holds_claim(current: &JobRecord, job: &JobRecord) -> bool {
    current.state == JobState::Claimed && current.claimed_by == job.claimed_by
}

fn requeue(entry: &mut Entry, delay: Duration) {
    entry.record.state = JobState::Ready;
    entry.record.claimed_by = None;
    entry.claim_expires_at = None;
    entry.ready_at = Instant::now() + delay;
    entry.record.available_at =
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
}

/// Shared between scheduler backends so reporting stays uniform.
pub(crate) fn publish_failure(
    events: &JobEventBus,
    job: &JobRecord,
    class: crate::error::ErrorClass,
    error: &ArchiveError,
    outcome: FailOutcome,
) {
    let kind = job.kind();
    match outcome {
        FailOutcome::Retrying { attempt, delay } => {
            debug!(job = %job.id, %kind, attempt, delay_ms = delay.as_millis() as u64, %class, error = %error, "job will retry");
            events.publish(JobEvent::Retrying {
                job_id: job.id,
                kind,
                attempt,
                delay_ms: delay.as_millis() as u64,
                class,
            });
        }
        FailOutcome::Requeued { delay } => {
            debug!(job = %job.id, %kind, delay_ms = delay.as_millis() as u64, "job requeued after contention");
            events.publish(JobEvent::Retrying {
                job_id: job.id,
                kind,
                attempt: job.attempts,
                delay_ms: delay.as_millis() as u64,
                class,
            });
        }
        FailOutcome::DeadLettered { attempts } => {
            events.publish(JobEvent::DeadLettered {
                job_id: job.id,
                kind,
                attempts,
                error: error.to_string(),
            });
        }
        FailOutcome::ClaimLost => {
            warn!(job = %job.id, %kind, worker = ?job.claimed_by, error = %error, "claim was lost before the failure was recorded");
        }
        FailOutcome::Dropped => {
            warn!(job = %job.id, %kind, subject = %job.payload.subject(), error = %error, "dropping job with malformed input");
            events.publish(JobEvent::Dropped {
                job_id: job.id,
                kind,
                error: error.to_string(),
            });
        }
    }
}
