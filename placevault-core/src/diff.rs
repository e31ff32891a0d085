//! Change detection against a fully transparent baseline.
//!
//! Diff frames are mostly transparent with only the changed pixels painted.
//! Anything past the anomaly cutoff is almost certainly a full frame and is
//! discarded instead of flooding the resolver.

use std::{fmt, sync::Arc};

use tracing::{debug, info};

use crate::error::{ArchiveError, Result};
use crate::resolve::PendingCoordinates;
use crate::types::{ChangedCoordinate, PartitionId};

pub const DEFAULT_ANOMALY_THRESHOLD: usize = 8_192;

const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffOutcome {
    Enqueued { changed: usize, newly_pending: usize },
    /// More than the cutoff changed; counting stopped at `changed`.
    Discarded { changed: usize },
}

/// Coordinates of every non-transparent pixel, or `None` once more than
/// `limit` are found.
pub fn changed_pixels(bytes: &[u8], limit: usize) -> Result<Option<Vec<(u32, u32)>>> {
    let raster = image::load_from_memory(bytes)?.to_rgba8();
    let mut changed = Vec::new();
    for (x, y, pixel) in raster.enumerate_pixels() {
        if pixel.0 != TRANSPARENT {
            if changed.len() == limit {
                return Ok(None);
            }
            changed.push((x, y));
        }
    }
    Ok(Some(changed))
}

pub struct ChangeDetector {
    pending: Arc<dyn PendingCoordinates>,
    threshold: usize,
}

impl fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    pub fn new(pending: Arc<dyn PendingCoordinates>, threshold: usize) -> Self {
        Self { pending, threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Decode on the blocking pool, then enqueue the changed coordinates.
    pub async fn detect(&self, partition: PartitionId, bytes: Vec<u8>) -> Result<DiffOutcome> {
        let limit = self.threshold;
        let pixels = tokio::task::spawn_blocking(move || changed_pixels(&bytes, limit))
            .await
            .map_err(|e| ArchiveError::Internal(format!("diff task failed: {e}")))??;

        let Some(pixels) = pixels else {
            info!(%partition, threshold = limit, "diff exceeds anomaly cutoff; discarding frame");
            return Ok(DiffOutcome::Discarded { changed: limit + 1 });
        };

        let coordinates: Vec<ChangedCoordinate> = pixels
            .iter()
            .map(|&(x, y)| ChangedCoordinate::new(partition, x, y))
            .collect();
        let newly_pending = self.pending.add(&coordinates).await?;
        debug!(%partition, changed = coordinates.len(), newly_pending, "diff enqueued");

        Ok(DiffOutcome::Enqueued {
            changed: coordinates.len(),
            newly_pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::InMemoryPendingCoordinates;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_with_changes(count: u32) -> Vec<u8> {
        let mut img = RgbaImage::new(200, 200);
        for i in 0..count {
            img.put_pixel(i % 200, i / 200, Rgba([255, 69, 0, 255]));
        }
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).expect("encode png");
        buf.into_inner()
    }

    #[tokio::test]
    async fn frames_above_cutoff_enqueue_nothing() {
        let pending = Arc::new(InMemoryPendingCoordinates::new());
        let detector = ChangeDetector::new(pending.clone(), DEFAULT_ANOMALY_THRESHOLD);

        let outcome = detector
            .detect(PartitionId(0), png_with_changes(9_000))
            .await
            .expect("detect");
        assert!(matches!(outcome, DiffOutcome::Discarded { .. }));
        assert_eq!(pending.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn small_diffs_enqueue_exactly_the_changed_pixels() {
        let pending = Arc::new(InMemoryPendingCoordinates::new());
        let detector = ChangeDetector::new(pending.clone(), DEFAULT_ANOMALY_THRESHOLD);

        let outcome = detector
            .detect(PartitionId(2), png_with_changes(10))
            .await
            .expect("detect");
        assert_eq!(
            outcome,
            DiffOutcome::Enqueued {
                changed: 10,
                newly_pending: 10
            }
        );

        let mut taken = pending.take(100).await.expect("take");
        taken.sort_by_key(|c| (c.y, c.x));
        let xs: Vec<u32> = taken.iter().map(|c| c.x).collect();
        assert_eq!(xs, (0..10).collect::<Vec<_>>());
        assert!(taken.iter().all(|c| c.y == 0 && c.partition == PartitionId(2)));
    }

    #[tokio::test]
    async fn exactly_at_cutoff_is_still_enqueued() {
        let pending = Arc::new(InMemoryPendingCoordinates::new());
        let detector = ChangeDetector::new(pending.clone(), 50);
        let outcome = detector
            .detect(PartitionId(0), png_with_changes(50))
            .await
            .expect("detect");
        assert!(matches!(outcome, DiffOutcome::Enqueued { changed: 50, .. }));
    }

    #[tokio::test]
    async fn undecodable_bytes_are_malformed() {
        let pending = Arc::new(InMemoryPendingCoordinates::new());
        let detector = ChangeDetector::new(pending, DEFAULT_ANOMALY_THRESHOLD);
        let err = detector
            .detect(PartitionId(0), b"not a png".to_vec())
            .await
            .expect_err("garbage must fail");
        assert_eq!(err.class(), crate::error::ErrorClass::MalformedPayload);
    }
}
