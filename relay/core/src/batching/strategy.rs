//! Batch-size strategies
//!
//! A [`TokenBatcher`](super::TokenBatcher) asks its strategy for a new target
//! size after every flush. [`FixedBatchSize`] never changes it;
//! [`AdaptiveBatchSize`] runs a single-step hysteresis loop over recent
//! latency and throughput.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Average latency above which the adaptive strategy shrinks batches
pub const HIGH_LATENCY: Duration = Duration::from_millis(100);

/// Average latency below which the adaptive strategy may grow batches
pub const LOW_LATENCY: Duration = Duration::from_millis(50);

/// Throughput (tokens/sec) the adaptive strategy requires before growing
pub const MIN_GROWTH_THROUGHPUT: f64 = 100.0;

/// Largest accepted batch size or buffer cap
pub const MAX_BATCH_LIMIT: usize = 10_000;

/// Largest accepted `adaptation_interval`
pub const MAX_ADAPTATION_INTERVAL: usize = 1_000;

/// Delivery measurements for one flushed batch
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchSample {
    /// Tokens in the batch, the sample's weight in the adaptive averages
    pub size: usize,
    /// How long the batch took to become ready (or to be delivered)
    pub latency: Duration,
    /// Tokens per second observed for this batch
    pub throughput: f64,
}

/// Decides the target batch size from observed batches
pub trait BatchSizeStrategy: Send + fmt::Debug {
    /// Record one batch and return the batch size to use from now on
    fn observe(&mut self, sample: BatchSample, current: usize) -> usize;

    /// Short name for logs and stats
    fn name(&self) -> &'static str;
}

/// Keeps the configured batch size forever
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedBatchSize;

impl BatchSizeStrategy for FixedBatchSize {
    fn observe(&mut self, _sample: BatchSample, current: usize) -> usize {
        current
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Bounds and cadence for [`AdaptiveBatchSize`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Smallest batch size the controller will choose
    pub min_batch_size: usize,
    /// Largest batch size the controller will choose
    pub max_batch_size: usize,
    /// Batches between adjustments (also the averaging window)
    pub adaptation_interval: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 20,
            adaptation_interval: 10,
        }
    }
}

impl AdaptiveConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lower bound
    #[must_use]
    pub fn with_min_batch_size(mut self, min: usize) -> Self {
        self.min_batch_size = min;
        self
    }

    /// Set the upper bound
    #[must_use]
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Set the number of batches between adjustments
    #[must_use]
    pub fn with_adaptation_interval(mut self, interval: usize) -> Self {
        self.adaptation_interval = interval;
        self
    }

    /// Check bounds
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero bound or interval,
    /// when `min_batch_size > max_batch_size`, or when `max_batch_size` or
    /// `adaptation_interval` exceed [`MAX_BATCH_LIMIT`] and
    /// [`MAX_ADAPTATION_INTERVAL`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batcher.min_batch_size must be at least 1".to_string(),
            ));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(ConfigError::ValidationError(format!(
                "batcher.min_batch_size ({}) exceeds batcher.max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.max_batch_size > MAX_BATCH_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "batcher.max_batch_size ({}) exceeds {MAX_BATCH_LIMIT}",
                self.max_batch_size
            )));
        }
        if self.adaptation_interval == 0 {
            return Err(ConfigError::ValidationError(
                "batcher.adaptation_interval must be at least 1".to_string(),
            ));
        }
        if self.adaptation_interval > MAX_ADAPTATION_INTERVAL {
            return Err(ConfigError::ValidationError(format!(
                "batcher.adaptation_interval ({}) exceeds {MAX_ADAPTATION_INTERVAL}",
                self.adaptation_interval
            )));
        }
        Ok(())
    }
}

/// Direction of the last adaptive adjustment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjustment {
    /// Batch size went down by one
    Decreased,
    /// Batch size went up by one
    Increased,
    /// No change at the last adaptation point
    Held,
}

/// Hysteresis controller for the batch size
///
/// Every `adaptation_interval` batches it averages the samples in its window:
/// slow batches shrink the size by one, fast high-throughput batches grow it
/// by one, anything in between holds. It never moves by more than one step.
#[derive(Debug)]
pub struct AdaptiveBatchSize {
    config: AdaptiveConfig,
    window: VecDeque<BatchSample>,
    since_adaptation: usize,
    last_adjustment: Option<Adjustment>,
}

impl AdaptiveBatchSize {
    /// Create a controller
    #[must_use]
    pub fn new(config: AdaptiveConfig) -> Self {
        let capacity = config.adaptation_interval.min(MAX_ADAPTATION_INTERVAL);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            since_adaptation: 0,
            last_adjustment: None,
        }
    }

    /// The controller's configuration
    #[must_use]
    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Result of the most recent adaptation point, if any has occurred
    #[must_use]
    pub fn last_adjustment(&self) -> Option<Adjustment> {
        self.last_adjustment
    }

    /// Per-token averages: each batch counts once for every token it carried
    fn averages(&self) -> (Duration, f64) {
        if self.window.is_empty() {
            return (Duration::ZERO, 0.0);
        }
        let mut tokens: u128 = 0;
        let mut latency_nanos: u128 = 0;
        let mut throughput = 0.0;
        for sample in &self.window {
            let weight = sample.size.max(1) as u128;
            tokens += weight;
            latency_nanos += weight * sample.latency.as_nanos();
            #[allow(clippy::cast_precision_loss)]
            let weighted = weight as f64 * sample.throughput;
            throughput += weighted;
        }
        let avg_latency =
            u64::try_from(latency_nanos / tokens).map_or(Duration::MAX, Duration::from_nanos);
        #[allow(clippy::cast_precision_loss)]
        let avg_throughput = throughput / tokens as f64;
        (avg_latency, avg_throughput)
    }
}

impl BatchSizeStrategy for AdaptiveBatchSize {
    fn observe(&mut self, sample: BatchSample, current: usize) -> usize {
        if self.window.len() == self.config.adaptation_interval {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.since_adaptation += 1;

        if self.since_adaptation < self.config.adaptation_interval {
            return current;
        }
        self.since_adaptation = 0;

        let (avg_latency, avg_throughput) = self.averages();
        let (next, adjustment) = if avg_latency > HIGH_LATENCY {
            (
                current.saturating_sub(1).max(self.config.min_batch_size),
                Adjustment::Decreased,
            )
        } else if avg_latency < LOW_LATENCY && avg_throughput > MIN_GROWTH_THROUGHPUT {
            (
                (current + 1).min(self.config.max_batch_size),
                Adjustment::Increased,
            )
        } else {
            (current, Adjustment::Held)
        };

        let adjustment = if next == current {
            Adjustment::Held
        } else {
            adjustment
        };
        self.last_adjustment = Some(adjustment);

        tracing::debug!(
            avg_latency_ms = avg_latency.as_secs_f64() * 1000.0,
            avg_throughput,
            from = current,
            to = next,
            "Adaptive batch size evaluated"
        );
        next
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}
