use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::JobRecord;
use super::queue::TaskScheduler;
use crate::error::{ArchiveError, Result};

/// Executes the body of a claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync + fmt::Debug {
    async fn execute(&self, job: &JobRecord) -> Result<()>;
}

/// Fixed-size pool of workers draining one scheduler.
///
/// Workers stop claiming once `shutdown` fires but always finish the job
/// they already hold; nothing in flight is aborted.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish()
    }
}

impl WorkerPool {
    pub fn spawn(
        parallelism: usize,
        scheduler: Arc<dyn TaskScheduler>,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        let group = format!("worker-{}", std::process::id());
        let handles = (0..parallelism.max(1))
            .map(|i| {
                let worker_id = format!("{group}-w{i}");
                let scheduler = Arc::clone(&scheduler);
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(worker_id, scheduler, handler, shutdown))
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to exit, giving each at most `grace`.
    pub async fn join(self, grace: Duration) {
        for handle in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker task failed: {:?}", e),
                Err(_) => warn!("Worker task timed out during shutdown"),
            }
        }
    }
}

async fn run_worker(
    worker_id: String,
    scheduler: Arc<dyn TaskScheduler>,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let job = match scheduler.claim(&worker_id, &shutdown).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                info!("Worker {} shutting down", worker_id);
                break;
            }
            Err(err) => {
                warn!(worker = %worker_id, error = %err, "claim failed; backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(scheduler.poll_interval()) => continue,
                }
            }
        };

        debug!(
            worker = %worker_id,
            job = %job.id,
            kind = %job.kind(),
            attempt = job.attempts,
            subject = %job.payload.subject(),
            "job claimed"
        );

        let result = AssertUnwindSafe(handler.execute(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(worker = %worker_id, job = %job.id, %reason, "job panicked");
                Err(ArchiveError::Internal(format!("job panicked: {reason}")))
            });

        let settled = match result {
            Ok(()) => scheduler.complete(&job).await,
            Err(err) => scheduler.fail(&job, &err).await.map(|_| ()),
        };
        if let Err(err) = settled {
            // The claim will expire and be redelivered.
            warn!(worker = %worker_id, job = %job.id, error = %err, "could not settle job");
        }
    }
}
