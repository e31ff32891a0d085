use std::{
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Growth curve applied between successive retries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffShape {
    Constant,
    #[default]
    Exponential,
    Fibonacci,
}

/// A single retry-delay policy shared by feed reconnects and job retries.
///
/// `attempt` is 1-based: the delay before the first retry is `base_delay(1)`.
/// Delays never decrease as `attempt` grows and never exceed `max_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default)]
    pub shape: BackoffShape,
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fraction of the anchor delay used as a symmetric jitter window.
    #[serde(default)]
    pub jitter_ratio: f32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(300))
    }
}

impl BackoffPolicy {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            shape: BackoffShape::Exponential,
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            jitter_ratio: 0.0,
        }
    }

    pub fn constant(delay: Duration) -> Self {
        Self {
            shape: BackoffShape::Constant,
            base_ms: delay.as_millis() as u64,
            max_ms: delay.as_millis() as u64,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_jitter(mut self, ratio: f32) -> Self {
        self.jitter_ratio = ratio.max(0.0);
        self
    }

    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 || self.base_ms == 0 {
            return 0;
        }

        let scaled = match self.shape {
            BackoffShape::Constant => self.base_ms as f64,
            BackoffShape::Exponential => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                (self.base_ms as f64) * 2f64.powi(exp)
            }
            BackoffShape::Fibonacci => (self.base_ms as f64) * fibonacci(attempt) as f64,
        };
        scaled.min(self.max_ms as f64).max(0.0) as u64
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms(attempt))
    }

    /// Delay with deterministic jitter seeded by `seed` and `attempt`, so
    /// the same retry of the same work item always lands at the same offset.
    pub fn delay_for(&self, attempt: u32, seed: impl Hash) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 || self.jitter_ratio <= 0.0 {
            return Duration::from_millis(anchor);
        }

        let span = (anchor as f64) * f64::from(self.jitter_ratio);
        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(self.max_ms as f64);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }

        let mut hasher = DefaultHasher::default();
        seed.hash(&mut hasher);
        attempt.hash(&mut hasher);
        let unit = (hasher.finish() as f64) / (u64::MAX as f64);
        Duration::from_millis((lower + (upper - lower) * unit).round() as u64)
    }

    /// Scale a delay by `factor`, still honouring the cap.
    pub fn stretched(&self, delay: Duration, factor: f32) -> Duration {
        let scaled = delay.as_millis() as f64 * f64::from(factor.max(1.0));
        Duration::from_millis(scaled.min(self.max_ms as f64) as u64)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
