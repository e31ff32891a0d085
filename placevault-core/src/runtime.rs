//! Start/stop lifecycle for the whole archiver.
//!
//! Shutdown runs in two phases. Ingestion (subscriptions, the ceiling
//! follower and the dispatcher) is cancelled and drained first. Then the
//! batcher, housekeeping and workers stop; workers finish the job they hold.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::ArchiveContext;
use crate::diff::ChangeDetector;
use crate::dispatch::Dispatcher;
use crate::download::DownloadCoordinator;
use crate::error::Result;
use crate::feed::SubscriptionManager;
use crate::jobs::{TaskScheduler, WorkerPool};
use crate::persist::Persister;
use crate::pipeline::PipelineJobHandler;
use crate::resolve::ResolutionBatcher;
use crate::types::FeedChannel;

pub struct ArchiverRuntime {
    ingest_shutdown: CancellationToken,
    work_shutdown: CancellationToken,
    subscriptions: Arc<SubscriptionManager>,
    ingest_tasks: Vec<(&'static str, JoinHandle<()>)>,
    work_tasks: Vec<(&'static str, JoinHandle<()>)>,
    workers: WorkerPool,
    grace: Duration,
}

impl std::fmt::Debug for ArchiverRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiverRuntime")
            .field("subscriptions", &self.subscriptions)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl ArchiverRuntime {
    pub async fn start(context: Arc<ArchiveContext>) -> Result<Self> {
        let config = context.config().clone();
        let ports = context.ports();

        if let Some(ceiling) = ports.tracker.seed().await? {
            info!(ceiling = %ceiling, "resuming known partitions");
        }

        let ingest_shutdown = CancellationToken::new();
        let work_shutdown = CancellationToken::new();

        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&ports.transport),
            Arc::clone(&ports.event_log),
            config.subscription,
            ingest_shutdown.clone(),
        ));
        subscriptions.ensure_channel(FeedChannel::Configuration);

        // Subscribe to the fanout before any subscription can append.
        let dispatcher = Dispatcher::new(
            Arc::clone(&ports.event_log),
            Arc::clone(&ports.scheduler),
            ports.tracker.clone(),
        )
        .run(ingest_shutdown.clone());

        let follower = {
            let subscriptions = Arc::clone(&subscriptions);
            let tracker = ports.tracker.clone();
            async move { subscriptions.follow(tracker).await }
        };

        let ingest_tasks = vec![
            ("dispatcher", tokio::spawn(dispatcher)),
            ("ceiling follower", tokio::spawn(follower)),
        ];

        let handler = PipelineJobHandler::new(
            DownloadCoordinator::new(
                Arc::clone(&ports.leases),
                Arc::clone(&ports.fetcher),
                Arc::clone(&ports.blobs),
                Arc::clone(&ports.snapshots),
                Arc::clone(&ports.scheduler),
                config.lease_ttl,
            ),
            ChangeDetector::new(Arc::clone(&ports.pending), config.anomaly_threshold),
            Arc::clone(&ports.resolver),
            Persister::new(Arc::clone(&ports.pixels)),
            Arc::clone(&ports.scheduler),
        );
        let workers = WorkerPool::spawn(
            config.worker_count,
            Arc::clone(&ports.scheduler),
            Arc::new(handler),
            work_shutdown.clone(),
        );

        let batcher = ResolutionBatcher::new(
            Arc::clone(&ports.pending),
            Arc::clone(&ports.scheduler),
            config.batch,
        );
        let work_tasks = vec![
            ("resolution batcher", tokio::spawn(batcher.run(work_shutdown.clone()))),
            (
                "housekeeping",
                tokio::spawn(housekeeping(
                    Arc::clone(&ports.scheduler),
                    config.reclaim_interval,
                    config.queue_report_interval,
                    work_shutdown.clone(),
                )),
            ),
        ];

        info!(workers = config.worker_count, "archiver started");
        Ok(Self {
            ingest_shutdown,
            work_shutdown,
            subscriptions,
            ingest_tasks,
            work_tasks,
            workers,
            grace: config.shutdown_grace,
        })
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub async fn shutdown(self) {
        info!("archiver shutting down");

        self.ingest_shutdown.cancel();
        self.subscriptions.join(self.grace).await;
        join_all(self.ingest_tasks, self.grace).await;

        self.work_shutdown.cancel();
        join_all(self.work_tasks, self.grace).await;
        self.workers.join(self.grace).await;

        info!("archiver stopped");
    }
}

async fn join_all(tasks: Vec<(&'static str, JoinHandle<()>)>, grace: Duration) {
    for (name, handle) in tasks {
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task failed: {:?}", name, e),
            Err(_) => warn!("{} task timed out during shutdown", name),
        }
    }
}

async fn housekeeping(
    scheduler: Arc<dyn TaskScheduler>,
    reclaim_every: Duration,
    report_every: Duration,
    shutdown: CancellationToken,
) {
    let mut reclaim = tokio::time::interval(reclaim_every);
    let mut report = tokio::time::interval(report_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = reclaim.tick() => match scheduler.reclaim_expired().await {
                Ok(0) => {}
                Ok(n) => warn!(reclaimed = n, "returned expired job claims to the queue"),
                Err(err) => warn!(error = %err, "claim reclaim failed"),
            },
            _ = report.tick() => match scheduler.snapshot().await {
                Ok(snapshot) => {
                    for (kind, counts) in &snapshot.kinds {
                        info!(
                            target: "placevault::jobs",
                            %kind,
                            ready = counts.ready,
                            deferred = counts.deferred,
                            claimed = counts.claimed,
                            dead_lettered = counts.dead_lettered,
                            "queue snapshot"
                        );
                    }
                }
                Err(err) => warn!(error = %err, "queue snapshot failed"),
            },
        }
    }
    info!("Housekeeping shutting down");
}
