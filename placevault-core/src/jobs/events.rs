use std::fmt;

use tokio::sync::broadcast;
use tracing::error;

use super::job::{JobId, JobKind};
use crate::error::ErrorClass;

/// Lifecycle notifications emitted by schedulers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Submitted {
        job_id: JobId,
        kind: JobKind,
    },
    Claimed {
        job_id: JobId,
        kind: JobKind,
        worker: String,
    },
    Completed {
        job_id: JobId,
        kind: JobKind,
    },
    Retrying {
        job_id: JobId,
        kind: JobKind,
        attempt: u32,
        delay_ms: u64,
        class: ErrorClass,
    },
    /// Attempt budget exhausted. Operator visible.
    DeadLettered {
        job_id: JobId,
        kind: JobKind,
        attempts: u32,
        error: String,
    },
    /// Malformed input, discarded without retry.
    Dropped {
        job_id: JobId,
        kind: JobKind,
        error: String,
    },
}

/// In-process fanout of job lifecycle events. Publishing never fails; with
/// no subscribers the event is simply discarded.
#[derive(Clone)]
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl fmt::Debug for JobEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        if let JobEvent::DeadLettered {
            job_id,
            kind,
            attempts,
            error,
        } = &event
        {
            error!(
                target: "placevault::jobs::terminal",
                job = %job_id,
                %kind,
                attempts,
                error = %error,
                "job failed terminally"
            );
        }
        let _ = self.sender.send(event);
    }
}
