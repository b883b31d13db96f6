//! Reconnect delay strategies.

use crate::config::{BackoffKind, FeedConfig};
use rand::Rng;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Maps a 1-based retry attempt to the delay before that attempt.
pub trait BackoffStrategy: Send + Sync + Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Build the strategy selected in `config`.
pub fn from_config(config: &FeedConfig) -> Arc<dyn BackoffStrategy> {
    match config.backoff {
        BackoffKind::Fixed => Arc::new(FixedBackoff::new(config.reconnect_interval())),
        BackoffKind::Exponential => Arc::new(ExponentialBackoff {
            initial_delay: config.reconnect_interval(),
            max_delay: config.max_reconnect_delay(),
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }),
    }
}

/// Same delay before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    interval: Duration,
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Exponential backoff with a cap and symmetric jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound before jitter.
    pub max_delay: Duration,
    /// Growth per attempt (2.0 doubles).
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl ExponentialBackoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let max_millis = self.max_delay.as_millis() as f64;
        let millis = if scaled.is_finite() {
            scaled.clamp(0.0, max_millis)
        } else {
            max_millis
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(millis.round() as u64)
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted_millis as u64)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.base_delay(attempt))
    }
}
