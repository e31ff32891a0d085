//! Job bodies for every pipeline stage.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use crate::diff::{ChangeDetector, DiffOutcome};
use crate::download::DownloadCoordinator;
use crate::error::Result;
use crate::jobs::{JobHandler, JobPayload, JobRecord, TaskScheduler};
use crate::persist::Persister;
use crate::resolve::{TileHistoryResolver, resolve_slots, submit_resolved};

pub struct PipelineJobHandler {
    downloads: DownloadCoordinator,
    detector: ChangeDetector,
    resolver: Arc<dyn TileHistoryResolver>,
    persister: Persister,
    scheduler: Arc<dyn TaskScheduler>,
}

impl fmt::Debug for PipelineJobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineJobHandler")
            .field("downloads", &self.downloads)
            .field("detector", &self.detector)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl PipelineJobHandler {
    pub fn new(
        downloads: DownloadCoordinator,
        detector: ChangeDetector,
        resolver: Arc<dyn TileHistoryResolver>,
        persister: Persister,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            downloads,
            detector,
            resolver,
            persister,
            scheduler,
        }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    async fn execute(&self, job: &JobRecord) -> Result<()> {
        match &job.payload {
            JobPayload::DownloadSnapshot(download) => {
                self.downloads.download(download).await?;
            }
            JobPayload::DiffSnapshot(diff) => {
                let outcome = self
                    .detector
                    .detect(diff.partition, diff.bytes.clone())
                    .await?;
                if let DiffOutcome::Discarded { .. } = outcome {
                    debug!(url = %diff.url, "snapshot treated as a full frame");
                }
            }
            JobPayload::ResolveBatch(batch) => {
                let results = resolve_slots(self.resolver.as_ref(), &batch.coordinates).await?;
                submit_resolved(self.scheduler.as_ref(), results).await?;
            }
            JobPayload::ResolveSingle(single) => {
                let results =
                    resolve_slots(self.resolver.as_ref(), std::slice::from_ref(&single.coordinate))
                        .await?;
                submit_resolved(self.scheduler.as_ref(), results).await?;
            }
            JobPayload::PersistPixel(pixel) => {
                self.persister.persist(pixel).await?;
            }
        }
        Ok(())
    }
}
