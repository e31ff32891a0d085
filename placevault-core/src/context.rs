//! Explicit application context: every port the pipeline talks to, built
//! once at startup and handed to each component.

use std::{fmt, sync::Arc, time::Duration};

use crate::blob::{BlobStore, InMemoryBlobStore};
use crate::diff::DEFAULT_ANOMALY_THRESHOLD;
use crate::error::{ArchiveError, Result};
use crate::event_log::{EventLog, InMemoryEventLog};
use crate::download::SnapshotFetcher;
use crate::feed::{ConfigTracker, FeedTransport, InMemoryCeilingStore, SubscriptionSettings};
use crate::jobs::{InMemoryTaskScheduler, JobEventBus, JobPolicyTable, TaskScheduler};
use crate::lease::{DEFAULT_LEASE_TTL, InMemoryLeaseStore, LeaseStore};
use crate::persist::{
    InMemoryPixelHistory, InMemorySnapshotRepository, PixelHistoryRepository, SnapshotRepository,
};
use crate::resolve::{
    BatchConfig, InMemoryPendingCoordinates, MAX_BATCH_SIZE, PendingCoordinates,
    TileHistoryResolver,
};

/// Runtime tunables for the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiverConfig {
    pub worker_count: usize,
    pub lease_ttl: Duration,
    pub anomaly_threshold: usize,
    pub batch: BatchConfig,
    pub subscription: SubscriptionSettings,
    pub policies: JobPolicyTable,
    /// How often expired job claims are returned to the queue.
    pub reclaim_interval: Duration,
    /// How often the queue snapshot is logged.
    pub queue_report_interval: Duration,
    /// How long shutdown waits for each task.
    pub shutdown_grace: Duration,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            lease_ttl: DEFAULT_LEASE_TTL,
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            batch: BatchConfig::default(),
            subscription: SubscriptionSettings::default(),
            policies: JobPolicyTable::default(),
            reclaim_interval: Duration::from_secs(30),
            queue_report_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ArchiverConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ArchiveError::InvalidConfig(msg.to_string()));
        if self.worker_count == 0 {
            return invalid("worker count must be at least 1");
        }
        if self.lease_ttl.is_zero() {
            return invalid("lease TTL must be non-zero");
        }
        if self.batch.batch_size == 0 {
            return invalid("resolver batch size must be at least 1");
        }
        if self.batch.batch_size > MAX_BATCH_SIZE {
            return Err(ArchiveError::InvalidConfig(format!(
                "resolver batch size must be at most {MAX_BATCH_SIZE}"
            )));
        }
        if self.batch.poll_interval.is_zero() {
            return invalid("batch poll interval must be non-zero");
        }
        self.policies.validate().map_err(ArchiveError::InvalidConfig)
    }
}

/// Every backend and upstream the pipeline uses.
pub struct ArchivePorts {
    pub event_log: Arc<dyn EventLog>,
    pub leases: Arc<dyn LeaseStore>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub blobs: Arc<dyn BlobStore>,
    pub snapshots: Arc<dyn SnapshotRepository>,
    pub pixels: Arc<dyn PixelHistoryRepository>,
    pub pending: Arc<dyn PendingCoordinates>,
    pub fetcher: Arc<dyn SnapshotFetcher>,
    pub resolver: Arc<dyn TileHistoryResolver>,
    pub transport: Arc<dyn FeedTransport>,
    pub tracker: ConfigTracker,
    pub events: JobEventBus,
}

impl fmt::Debug for ArchivePorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchivePorts")
            .field("event_log", &self.event_log)
            .field("leases", &self.leases)
            .field("scheduler", &self.scheduler)
            .field("blobs", &self.blobs)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl ArchivePorts {
    /// Single-process backends around the given upstreams. The job event
    /// bus is shared with the in-memory scheduler.
    pub fn in_memory(
        policies: JobPolicyTable,
        transport: Arc<dyn FeedTransport>,
        fetcher: Arc<dyn SnapshotFetcher>,
        resolver: Arc<dyn TileHistoryResolver>,
    ) -> Self {
        let events = JobEventBus::default();
        Self {
            event_log: Arc::new(InMemoryEventLog::default()),
            leases: Arc::new(InMemoryLeaseStore::new()),
            scheduler: Arc::new(InMemoryTaskScheduler::new(policies, events.clone())),
            blobs: Arc::new(InMemoryBlobStore::new()),
            snapshots: Arc::new(InMemorySnapshotRepository::new()),
            pixels: Arc::new(InMemoryPixelHistory::new()),
            pending: Arc::new(InMemoryPendingCoordinates::new()),
            fetcher,
            resolver,
            transport,
            tracker: ConfigTracker::new(Arc::new(InMemoryCeilingStore::new())),
            events,
        }
    }
}

pub struct ArchiveContext {
    config: ArchiverConfig,
    ports: ArchivePorts,
}

impl fmt::Debug for ArchiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveContext")
            .field("config", &self.config)
            .field("event_log", &self.ports.event_log)
            .field("scheduler", &self.ports.scheduler)
            .field("tracker", &self.ports.tracker)
            .finish_non_exhaustive()
    }
}

impl ArchiveContext {
    pub fn new(config: ArchiverConfig, ports: ArchivePorts) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, ports })
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    pub fn ports(&self) -> &ArchivePorts {
        &self.ports
    }

    pub fn event_log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.ports.event_log)
    }

    pub fn scheduler(&self) -> Arc<dyn TaskScheduler> {
        Arc::clone(&self.ports.scheduler)
    }

    pub fn tracker(&self) -> ConfigTracker {
        self.ports.tracker.clone()
    }

    pub fn events(&self) -> JobEventBus {
        self.ports.events.clone()
    }
}
