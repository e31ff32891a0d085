use std::{fmt, sync::Arc};

use tracing::debug;

use super::{InsertOutcome, PixelHistoryRepository, timestamp_from_millis};
use crate::error::Result;
use crate::jobs::PersistPixelJob;
use crate::types::PixelRecord;

/// Body of `PersistPixel` jobs.
pub struct Persister {
    pixels: Arc<dyn PixelHistoryRepository>,
}

impl fmt::Debug for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("pixels", &self.pixels)
            .finish()
    }
}

impl Persister {
    pub fn new(pixels: Arc<dyn PixelHistoryRepository>) -> Self {
        Self { pixels }
    }

    pub async fn persist(&self, job: &PersistPixelJob) -> Result<InsertOutcome> {
        let record = PixelRecord {
            partition: job.partition,
            x: job.x,
            y: job.y,
            modified: timestamp_from_millis(job.modified_ms)?,
            author: job.author.clone(),
        };
        let outcome = self.pixels.insert_pixel(&record).await?;
        debug!(
            partition = %record.partition,
            x = record.x,
            y = record.y,
            modified = %record.modified,
            ?outcome,
            "pixel persisted"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::persist::InMemoryPixelHistory;
    use crate::types::PartitionId;

    fn job(modified_ms: i64) -> PersistPixelJob {
        PersistPixelJob {
            partition: PartitionId(0),
            x: 3,
            y: 4,
            author: "painter".into(),
            modified_ms,
        }
    }

    #[tokio::test]
    async fn replayed_job_stores_one_row() {
        let pixels = Arc::new(InMemoryPixelHistory::new());
        let persister = Persister::new(pixels.clone());

        assert_eq!(persister.persist(&job(1_649_000_000_001)).await.expect("persist"), InsertOutcome::Inserted);
        assert_eq!(
            persister.persist(&job(1_649_000_000_001)).await.expect("persist"),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(pixels.count().await.expect("count"), 1);
        assert_eq!(pixels.records()[0].modified.timestamp_millis(), 1_649_000_000_001);
    }

    #[tokio::test]
    async fn out_of_range_timestamp_is_malformed() {
        let persister = Persister::new(Arc::new(InMemoryPixelHistory::new()));
        let err = persister.persist(&job(i64::MAX)).await.expect_err("out of range");
        assert_eq!(err.class(), ErrorClass::MalformedPayload);
    }
}
