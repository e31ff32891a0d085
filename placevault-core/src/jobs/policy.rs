use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::job::{JobKind, JobRecord};
use crate::backoff::BackoffPolicy;
use crate::error::ErrorClass;

/// Retry and priority knobs for one job kind.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPolicy {
    pub priority: i16,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Multiplier applied to the backoff delay for throttled failures.
    pub rate_limit_factor: f32,
    /// Requeue delay after a lost lease race.
    pub contention_delay_ms: u64,
    /// Contention requeues allowed before they start consuming attempts.
    pub max_contention_retries: u32,
}

impl JobPolicy {
    pub fn new(priority: i16, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            priority,
            max_attempts,
            backoff,
            rate_limit_factor: 4.0,
            contention_delay_ms: 500,
            max_contention_retries: 240,
        }
    }

    pub fn contention_delay(&self) -> Duration {
        Duration::from_millis(self.contention_delay_ms)
    }

    /// Decide what happens to `job` after a failure of the given class.
    pub fn decide(&self, job: &JobRecord, class: ErrorClass) -> RetryDecision {
        match class {
            ErrorClass::MalformedPayload => RetryDecision::Drop,
            ErrorClass::LockContention
                if job.contention_retries < self.max_contention_retries =>
            {
                RetryDecision::Requeue {
                    delay: self.contention_delay(),
                }
            }
            _ => {
                let attempt = job.attempts.saturating_add(1);
                if attempt >= self.max_attempts {
                    return RetryDecision::Terminal { attempts: attempt };
                }
                let mut delay = self.backoff.delay_for(attempt, job.id);
                if class == ErrorClass::RateLimited {
                    delay = self.backoff.stretched(delay, self.rate_limit_factor);
                }
                RetryDecision::Retry { attempt, delay }
            }
        }
    }
}

/// Outcome of [`JobPolicy::decide`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Counted retry: `attempt` is the new attempt count.
    Retry { attempt: u32, delay: Duration },
    /// Uncounted requeue after lock contention.
    Requeue { delay: Duration },
    /// Attempt budget exhausted.
    Terminal { attempts: u32 },
    /// Malformed input; never retried.
    Drop,
}

/// Declarative per-kind policy consumed uniformly by every scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPolicyTable {
    pub download_snapshot: JobPolicy,
    pub diff_snapshot: JobPolicy,
    pub resolve_batch: JobPolicy,
    pub resolve_single: JobPolicy,
    pub persist_pixel: JobPolicy,
}

impl Default for JobPolicyTable {
    fn default() -> Self {
        let standard = BackoffPolicy::exponential(Duration::from_secs(2), Duration::from_secs(300));
        Self {
            download_snapshot: JobPolicy::new(30, 10, standard),
            diff_snapshot: JobPolicy::new(
                40,
                2,
                BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60)),
            ),
            resolve_batch: JobPolicy::new(50, 5, standard),
            resolve_single: JobPolicy::new(50, 5, standard),
            persist_pixel: JobPolicy::new(
                60,
                100,
                BackoffPolicy::exponential(Duration::from_millis(500), Duration::from_secs(300)),
            ),
        }
    }
}

impl JobPolicyTable {
    pub fn for_kind(&self, kind: JobKind) -> &JobPolicy {
        match kind {
            JobKind::DownloadSnapshot => &self.download_snapshot,
            JobKind::DiffSnapshot => &self.diff_snapshot,
            JobKind::ResolveBatch => &self.resolve_batch,
            JobKind::ResolveSingle => &self.resolve_single,
            JobKind::PersistPixel => &self.persist_pixel,
        }
    }

    pub fn for_kind_mut(&mut self, kind: JobKind) -> &mut JobPolicy {
        match kind {
            JobKind::DownloadSnapshot => &mut self.download_snapshot,
            JobKind::DiffSnapshot => &mut self.diff_snapshot,
            JobKind::ResolveBatch => &mut self.resolve_batch,
            JobKind::ResolveSingle => &mut self.resolve_single,
            JobKind::PersistPixel => &mut self.persist_pixel,
        }
    }

    /// Every policy must allow at least one execution.
    pub fn validate(&self) -> Result<(), String> {
        for kind in JobKind::ALL {
            if self.for_kind(kind).max_attempts == 0 {
                return Err(format!("max_attempts for {kind} must be at least 1"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{DownloadSnapshotJob, JobPayload};
    use crate::types::PartitionId;

    fn download_job() -> JobRecord {
        JobRecord::new(
            JobPayload::DownloadSnapshot(DownloadSnapshotJob {
                partition: PartitionId(0),
                url: "https://cdn.test/a.png".into(),
            }),
            30,
        )
    }

    #[test]
    fn delays_grow_then_stop_exactly_at_max_attempts() {
        let policy = JobPolicyTable::default().resolve_batch;
        let mut job = download_job();
        let mut delays = Vec::new();

        loop {
            match policy.decide(&job, ErrorClass::PermanentUpstreamError) {
                RetryDecision::Retry { attempt, delay } => {
                    job.attempts = attempt;
                    delays.push(delay);
                }
                RetryDecision::Terminal { attempts } => {
                    assert_eq!(attempts, policy.max_attempts);
                    break;
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }

        assert_eq!(delays.len() as u32, policy.max_attempts - 1);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(300)));
    }

    #[test]
    fn rate_limited_failures_back_off_longer() {
        let policy = JobPolicyTable::default().download_snapshot;
        let job = download_job();
        let RetryDecision::Retry { delay: normal, .. } =
            policy.decide(&job, ErrorClass::TransientNetwork)
        else {
            panic!("expected retry");
        };
        let RetryDecision::Retry { delay: throttled, .. } =
            policy.decide(&job, ErrorClass::RateLimited)
        else {
            panic!("expected retry");
        };
        assert!(throttled > normal);
    }

    #[test]
    fn contention_does_not_consume_attempts_until_its_budget_runs_out() {
        let policy = JobPolicyTable::default().download_snapshot;
        let mut job = download_job();
        assert_eq!(
            policy.decide(&job, ErrorClass::LockContention),
            RetryDecision::Requeue {
                delay: policy.contention_delay()
            }
        );

        job.contention_retries = policy.max_contention_retries;
        assert!(matches!(
            policy.decide(&job, ErrorClass::LockContention),
            RetryDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        let policy = JobPolicyTable::default().persist_pixel;
        assert_eq!(
            policy.decide(&download_job(), ErrorClass::MalformedPayload),
            RetryDecision::Drop
        );
    }

    #[test]
    fn zero_attempt_policy_is_rejected() {
        let mut table = JobPolicyTable::default();
        table.for_kind_mut(JobKind::DiffSnapshot).max_attempts = 0;
        assert!(table.validate().is_err());
    }
}
