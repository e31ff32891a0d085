use std::{fmt, sync::Arc, time::Duration};

use tokio_stream::{StreamExt, wrappers::BroadcastStream, wrappers::errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{Envelope, FeedMessage, decode};
use crate::backoff::BackoffPolicy;
use crate::error::{ErrorClass, Result};
use crate::event_log::EventLog;
use crate::feed::ConfigTracker;
use crate::jobs::{DownloadSnapshotJob, JobId, JobPayload, TaskScheduler};
use crate::types::{FeedChannel, LoggedFrame, PartitionId, Sequence};

/// Frames fetched per `read_after` call while catching up.
const CATCH_UP_BATCH: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionSource {
    EnvelopeTag,
    Channel,
    /// `max(0, subscription id - 2)`; only used when nothing better exists.
    SubscriptionOffset,
}

/// Where a frame-pointer message belongs. Explicit tags win over the channel
/// the frame arrived on, which wins over subscription-id arithmetic.
pub fn resolve_partition(
    envelope: &Envelope,
    channel: FeedChannel,
) -> Option<(PartitionId, PartitionSource)> {
    if let Some(partition) = envelope.canvas_id {
        return Some((partition, PartitionSource::EnvelopeTag));
    }
    if let Some(partition) = channel.partition() {
        return Some((partition, PartitionSource::Channel));
    }
    envelope
        .subscription_id
        .map(|id| (PartitionId::from_subscription_id(id), PartitionSource::SubscriptionOffset))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Control,
    Configuration { ceiling: PartitionId, raised: bool },
    Download { partition: PartitionId, url: String, job: JobId },
    Dropped(String),
}

pub struct Dispatcher {
    log: Arc<dyn EventLog>,
    scheduler: Arc<dyn TaskScheduler>,
    tracker: ConfigTracker,
    retry: BackoffPolicy,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tracker", &self.tracker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        log: Arc<dyn EventLog>,
        scheduler: Arc<dyn TaskScheduler>,
        tracker: ConfigTracker,
    ) -> Self {
        Self {
            log,
            scheduler,
            tracker,
            retry: BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(30)),
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn dispatch(&self, logged: &LoggedFrame) -> Result<DispatchOutcome> {
        let frame = &logged.frame;
        let envelope = decode(&frame.payload);

        match &envelope.message {
            FeedMessage::Control(kind) => {
                debug!(channel = %frame.channel, %kind, "control frame");
                Ok(DispatchOutcome::Control)
            }
            FeedMessage::Configuration { max_index } => {
                let raised = self.tracker.publish(*max_index).await?;
                Ok(DispatchOutcome::Configuration {
                    ceiling: *max_index,
                    raised,
                })
            }
            FeedMessage::FramePointer { kind, url } => {
                let Some((partition, source)) = resolve_partition(&envelope, frame.channel) else {
                    warn!(sequence = %logged.sequence, %url, "frame pointer without any partition hint");
                    return Ok(DispatchOutcome::Dropped("no partition".into()));
                };
                if source == PartitionSource::SubscriptionOffset {
                    warn!(
                        sequence = %logged.sequence,
                        subscription = ?envelope.subscription_id,
                        %partition,
                        "partition inferred from subscription id"
                    );
                }

                let job = self
                    .scheduler
                    .submit(JobPayload::DownloadSnapshot(DownloadSnapshotJob {
                        partition,
                        url: url.clone(),
                    }))
                    .await?;
                debug!(%partition, %url, ?kind, %job, "snapshot download scheduled");
                Ok(DispatchOutcome::Download {
                    partition,
                    url: url.clone(),
                    job,
                })
            }
            FeedMessage::Unrecognized(reason) => {
                warn!(
                    sequence = %logged.sequence,
                    channel = %frame.channel,
                    %reason,
                    "dropping unrecognized feed frame"
                );
                Ok(DispatchOutcome::Dropped(reason.clone()))
            }
        }
    }

    /// Dispatch a logged frame at most once per sequence. Failures are retried
    /// in place so the frame is never skipped; returns false if shutdown
    /// interrupted the retries.
    async fn dispatch_logged(
        &self,
        logged: &LoggedFrame,
        last: &mut Option<Sequence>,
        shutdown: &CancellationToken,
    ) -> bool {
        if last.is_some_and(|seen| logged.sequence <= seen) {
            return true;
        }
        let mut attempt = 0u32;
        loop {
            let err = match self.dispatch(logged).await {
                Ok(_) => break,
                Err(err) if err.class() == ErrorClass::MalformedPayload => {
                    warn!(sequence = %logged.sequence, error = %err, "dropping undispatchable frame");
                    break;
                }
                Err(err) => err,
            };
            attempt = attempt.saturating_add(1);
            let delay = self.retry.delay_for(attempt, logged.sequence);
            warn!(
                sequence = %logged.sequence,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "dispatch failed; retrying"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        *last = Some(logged.sequence);
        true
    }

    /// Recover frames missed by a lagging fanout receiver.
    async fn catch_up(&self, last: &mut Option<Sequence>, shutdown: &CancellationToken) {
        let Some(mut cursor) = *last else {
            warn!("fanout lagged before the first frame; missed frames stay in the log");
            return;
        };
        loop {
            let frames = match self.log.read_after(cursor, CATCH_UP_BATCH).await {
                Ok(frames) => frames,
                Err(err) => {
                    warn!(after = %cursor, error = %err, "catch-up read failed");
                    return;
                }
            };
            let Some(tail) = frames.last() else {
                return;
            };
            cursor = tail.sequence;
            for logged in &frames {
                if !self.dispatch_logged(logged, last, shutdown).await {
                    return;
                }
            }
            if frames.len() < CATCH_UP_BATCH {
                return;
            }
        }
    }

    /// Consume the log's live fanout until shutdown. The fanout is
    /// subscribed when this is called, not when the future is first polled.
    pub fn run(self, shutdown: CancellationToken) -> impl Future<Output = ()> + Send {
        let stream = BroadcastStream::new(self.log.fanout());
        self.consume(stream, shutdown)
    }

    async fn consume(self, mut stream: BroadcastStream<LoggedFrame>, shutdown: CancellationToken) {
        let mut last: Option<Sequence> = None;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(logged)) => {
                    if !self.dispatch_logged(&logged, &mut last, &shutdown).await {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(missed, "dispatcher lagged behind the fanout; catching up");
                    self.catch_up(&mut last, &shutdown).await;
                }
                None => break,
            }
        }
        info!("Dispatcher shutting down");
    }
}
