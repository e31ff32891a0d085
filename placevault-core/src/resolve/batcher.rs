use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{SlotId, SlotRequest, SlotResult, TileHistoryResolver};
use super::pending::PendingCoordinates;
use crate::error::{ArchiveError, Result};
use crate::jobs::{JobPayload, PersistPixelJob, ResolveBatchJob, ResolveSingleJob, TaskScheduler};
use crate::types::ChangedCoordinate;

pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Slots are numbered from 1 as `u16`, which bounds one round trip.
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    /// Fixed arity of one resolution round trip.
    pub batch_size: usize,
    /// How often the pending set is checked.
    pub poll_interval: Duration,
    /// How long a partial batch may wait before it is split into singles.
    pub partial_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(100),
            partial_wait: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub singles: usize,
}

/// Drains pending coordinates into fixed-size `ResolveBatch` jobs. A
/// partial batch that outlives the wait budget becomes `ResolveSingle` jobs
/// instead of being padded.
pub struct ResolutionBatcher {
    pending: Arc<dyn PendingCoordinates>,
    scheduler: Arc<dyn TaskScheduler>,
    config: BatchConfig,
    partial_since: Option<Instant>,
}

impl fmt::Debug for ResolutionBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionBatcher")
            .field("config", &self.config)
            .field("partial_since", &self.partial_since)
            .finish_non_exhaustive()
    }
}

impl ResolutionBatcher {
    pub fn new(
        pending: Arc<dyn PendingCoordinates>,
        scheduler: Arc<dyn TaskScheduler>,
        config: BatchConfig,
    ) -> Self {
        Self {
            pending,
            scheduler,
            config,
            partial_since: None,
        }
    }

    pub async fn drain_once(&mut self) -> Result<DrainReport> {
        let size = self.config.batch_size.max(1);
        let mut report = DrainReport::default();

        loop {
            let available = self.pending.len().await?;
            if available == 0 {
                self.partial_since = None;
                break;
            }

            if available >= size {
                let batch = self.pending.take(size).await?;
                if batch.len() == size {
                    let payload = JobPayload::ResolveBatch(ResolveBatchJob {
                        coordinates: batch.clone(),
                    });
                    if let Err(err) = self.scheduler.submit(payload).await {
                        return Err(self.restore(&batch, err).await);
                    }
                    report.batches += 1;
                    self.partial_since = None;
                } else {
                    // Another consumer drained part of the set between len and take.
                    report.singles += self.submit_singles(batch).await?;
                }
                continue;
            }

            let since = *self.partial_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.config.partial_wait {
                let rest = self.pending.take(available).await?;
                report.singles += self.submit_singles(rest).await?;
                self.partial_since = None;
            }
            break;
        }

        if report != DrainReport::default() {
            debug!(batches = report.batches, singles = report.singles, "pending coordinates drained");
        }
        Ok(report)
    }

    async fn submit_singles(&self, coordinates: Vec<ChangedCoordinate>) -> Result<usize> {
        for (i, coordinate) in coordinates.iter().enumerate() {
            let payload = JobPayload::ResolveSingle(ResolveSingleJob {
                coordinate: *coordinate,
            });
            if let Err(err) = self.scheduler.submit(payload).await {
                return Err(self.restore(&coordinates[i..], err).await);
            }
        }
        Ok(coordinates.len())
    }

    /// Put taken but unsubmitted coordinates back so a later drain retries them.
    async fn restore(&self, coordinates: &[ChangedCoordinate], err: ArchiveError) -> ArchiveError {
        match self.pending.add(coordinates).await {
            Ok(_) => debug!(count = coordinates.len(), "returned coordinates to the pending set"),
            Err(restore_err) => error!(
                count = coordinates.len(),
                error = %restore_err,
                "could not return coordinates to the pending set"
            ),
        }
        err
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Resolution batcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.drain_once().await {
                        warn!(error = %err, "draining pending coordinates failed");
                    }
                }
            }
        }
    }
}

/// Resolve coordinates in one round trip and pair each with its own slot's
/// result. Slots absent from the reply come back as missing.
pub async fn resolve_slots(
    resolver: &dyn TileHistoryResolver,
    coordinates: &[ChangedCoordinate],
) -> Result<Vec<(ChangedCoordinate, SlotResult)>> {
    let requests: Vec<SlotRequest> = coordinates
        .iter()
        .enumerate()
        .map(|(i, coordinate)| {
            let slot = u16::try_from(i + 1).map_err(|_| {
                ArchiveError::malformed(format!(
                    "{} coordinates exceed the {MAX_BATCH_SIZE} slots of one request",
                    coordinates.len()
                ))
            })?;
            Ok(SlotRequest {
                slot: SlotId(slot),
                coordinate: *coordinate,
            })
        })
        .collect::<Result<_>>()?;

    let mut by_slot: HashMap<SlotId, SlotResult> =
        resolver.resolve(&requests).await?.into_iter().collect();

    Ok(requests
        .into_iter()
        .map(|request| {
            let result = by_slot
                .remove(&request.slot)
                .unwrap_or_else(|| SlotResult::Missing("slot absent from reply".into()));
            (request.coordinate, result)
        })
        .collect())
}

/// Turns resolved slots into persist jobs; missing slots are dropped.
pub async fn submit_resolved(
    scheduler: &dyn TaskScheduler,
    results: Vec<(ChangedCoordinate, SlotResult)>,
) -> Result<usize> {
    let mut submitted = 0;
    for (coordinate, result) in results {
        match result {
            SlotResult::Resolved(history) => {
                scheduler
                    .submit(JobPayload::PersistPixel(PersistPixelJob {
                        partition: coordinate.partition,
                        x: coordinate.x,
                        y: coordinate.y,
                        author: history.author,
                        modified_ms: history.modified_ms,
                    }))
                    .await?;
                submitted += 1;
            }
            SlotResult::Missing(reason) => {
                warn!(
                    partition = %coordinate.partition,
                    x = coordinate.x,
                    y = coordinate.y,
                    %reason,
                    "dropping unresolvable coordinate"
                );
            }
        }
    }
    Ok(submitted)
}
