//! Lease-guarded snapshot downloads.
//!
//! At most one worker fetches a given URL at a time. The lease TTL is the
//! only recovery path for a crashed holder, and a fetch that outlives the TTL
//! is not protected: a second worker may fetch the same URL concurrently. The
//! snapshot insert is conflict-free so that race stays harmless.

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::blob::{BlobKey, BlobStore};
use crate::error::{ArchiveError, Result};
use crate::jobs::{DiffSnapshotJob, DownloadSnapshotJob, JobPayload, TaskScheduler};
use crate::lease::{LeaseStore, ReleaseOutcome, download_key};
use crate::persist::{InsertOutcome, SnapshotRepository};
use crate::types::SnapshotRecord;

pub mod fetcher;

pub use fetcher::{HttpSnapshotFetcher, SnapshotFetcher};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Fetched { bytes: usize, record: InsertOutcome },
    /// The URL was recorded by an earlier holder; nothing was fetched.
    AlreadyRecorded,
}

pub struct DownloadCoordinator {
    leases: Arc<dyn LeaseStore>,
    fetcher: Arc<dyn SnapshotFetcher>,
    blobs: Arc<dyn BlobStore>,
    snapshots: Arc<dyn SnapshotRepository>,
    scheduler: Arc<dyn TaskScheduler>,
    lease_ttl: Duration,
}

impl fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl DownloadCoordinator {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        fetcher: Arc<dyn SnapshotFetcher>,
        blobs: Arc<dyn BlobStore>,
        snapshots: Arc<dyn SnapshotRepository>,
        scheduler: Arc<dyn TaskScheduler>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            leases,
            fetcher,
            blobs,
            snapshots,
            scheduler,
            lease_ttl,
        }
    }

    /// Run one download under the URL's lease. Contention is reported as
    /// [`ArchiveError::LockContention`] so the scheduler requeues promptly.
    pub async fn download(&self, job: &DownloadSnapshotJob) -> Result<DownloadOutcome> {
        let key = download_key(&job.url);
        let Some(token) = self.leases.acquire(&key, self.lease_ttl).await? else {
            debug!(url = %job.url, "download lease busy");
            return Err(ArchiveError::LockContention { key });
        };

        let result = self.fetch_and_record(job).await;

        match self.leases.release(&key, token).await {
            Ok(ReleaseOutcome::Released) => {}
            Ok(ReleaseOutcome::NotHeld) => {
                warn!(url = %job.url, ttl = ?self.lease_ttl, "download outlived its lease")
            }
            Err(err) => warn!(url = %job.url, error = %err, "lease release failed; waiting for expiry"),
        }

        result
    }

    async fn fetch_and_record(&self, job: &DownloadSnapshotJob) -> Result<DownloadOutcome> {
        if self.snapshots.snapshot_exists(&job.url).await? {
            debug!(url = %job.url, "snapshot already recorded");
            return Ok(DownloadOutcome::AlreadyRecorded);
        }

        let bytes = self.fetcher.fetch(&job.url).await?;
        let size = bytes.len();
        self.blobs.upload(&BlobKey::from_url(&job.url), &bytes).await?;

        // Diff first so a crash before the insert refetches instead of
        // losing the change set.
        self.scheduler
            .submit(JobPayload::DiffSnapshot(DiffSnapshotJob {
                partition: job.partition,
                url: job.url.clone(),
                bytes,
            }))
            .await?;

        let record = SnapshotRecord {
            url: job.url.clone(),
            fetched_at: Utc::now(),
            size: i64::try_from(size).unwrap_or(i64::MAX),
        };
        let inserted = self.snapshots.insert_snapshot(&record).await?;
        info!(partition = %job.partition, url = %job.url, bytes = size, ?inserted, "snapshot archived");

        Ok(DownloadOutcome::Fetched {
            bytes: size,
            record: inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::jobs::{InMemoryTaskScheduler, JobEventBus, JobKind, JobPolicyTable};
    use crate::lease::InMemoryLeaseStore;
    use crate::persist::InMemorySnapshotRepository;
    use crate::types::PartitionId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct SlowFetcher {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotFetcher for SlowFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![1, 2, 3, 4])
        }
    }

    #[derive(Debug)]
    struct FailingFetcher;

    #[async_trait]
    impl SnapshotFetcher for FailingFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            Err(ArchiveError::HttpStatus {
                status: 429,
                url: url.to_string(),
            })
        }
    }

    struct Fixture {
        leases: Arc<InMemoryLeaseStore>,
        blobs: Arc<InMemoryBlobStore>,
        snapshots: Arc<InMemorySnapshotRepository>,
        scheduler: Arc<InMemoryTaskScheduler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                leases: Arc::new(InMemoryLeaseStore::new()),
                blobs: Arc::new(InMemoryBlobStore::new()),
                snapshots: Arc::new(InMemorySnapshotRepository::new()),
                scheduler: Arc::new(InMemoryTaskScheduler::new(
                    JobPolicyTable::default(),
                    JobEventBus::default(),
                )),
            }
        }

        fn coordinator(&self, fetcher: Arc<dyn SnapshotFetcher>, ttl: Duration) -> DownloadCoordinator {
            DownloadCoordinator::new(
                self.leases.clone(),
                fetcher,
                self.blobs.clone(),
                self.snapshots.clone(),
                self.scheduler.clone(),
                ttl,
            )
        }
    }

    fn job(url: &str) -> DownloadSnapshotJob {
        DownloadSnapshotJob {
            partition: PartitionId(1),
            url: url.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_attempts_fetch_once() {
        let fx = Fixture::new();
        let fetcher = Arc::new(SlowFetcher {
            delay: Duration::from_secs(1),
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(fx.coordinator(fetcher.clone(), Duration::from_secs(60)));
        let url = "https://cdn.example/canvas/1.png";

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.download(&job(url)).await })
            })
            .collect();

        let mut fetched = 0;
        let mut contended = 0;
        for attempt in attempts {
            match attempt.await.expect("join") {
                Ok(DownloadOutcome::Fetched { .. }) => fetched += 1,
                Err(ArchiveError::LockContention { .. }) => contended += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!((fetched, contended), (1, 7));

        // A contender retrying after the winner finished does not refetch.
        assert_eq!(
            coordinator.download(&job(url)).await.expect("retry"),
            DownloadOutcome::AlreadyRecorded
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.blobs.upload_count(), 1);
        assert_eq!(
            fx.blobs.get(&BlobKey::new("cdn.example/canvas/1.png")),
            Some(vec![1, 2, 3, 4])
        );
        assert_eq!(fx.snapshots.get(url).map(|r| r.size), Some(4));
        assert!(!fx.leases.is_held(&download_key(url)));

        let snapshot = fx.scheduler.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.counts(JobKind::DiffSnapshot).ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_race_inserts_snapshot_once() {
        let fx = Fixture::new();
        let fetcher = Arc::new(SlowFetcher {
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(fx.coordinator(fetcher.clone(), Duration::from_secs(1)));
        let url = "https://cdn.example/canvas/2.png";

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.download(&job(url)).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.download(&job(url)).await })
        };

        let first = first.await.expect("join").expect("first download");
        let second = second.await.expect("join").expect("second download");

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        let mut records = [first, second].map(|outcome| match outcome {
            DownloadOutcome::Fetched { record, .. } => record,
            DownloadOutcome::AlreadyRecorded => panic!("both holders fetched"),
        });
        records.sort_by_key(|r| *r == InsertOutcome::AlreadyPresent);
        assert_eq!(records, [InsertOutcome::Inserted, InsertOutcome::AlreadyPresent]);
        assert_eq!(fx.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_releases_lease_and_records_nothing() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(Arc::new(FailingFetcher), Duration::from_secs(60));
        let url = "https://cdn.example/canvas/3.png";

        let err = coordinator.download(&job(url)).await.expect_err("429");
        assert_eq!(err.class(), crate::error::ErrorClass::RateLimited);
        assert!(!fx.leases.is_held(&download_key(url)));
        assert!(fx.snapshots.is_empty());
        assert!(fx.scheduler.is_empty());
    }
}
