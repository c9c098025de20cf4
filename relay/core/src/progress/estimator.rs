//! Progress Estimator Implementation
//!
//! Turns token arrivals into throttled, confidence-rated completion reports.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::profile::ModelProfiles;
use super::strategy::{
    mean, smoothed, tail, variance, EstimateContext, EstimateStrategy, GenericBlend,
    ModelSpecific, SLOWDOWN_WINDOW, STABILITY_WINDOW,
};
use crate::config::ConfigError;

/// Completed-stream totals kept for recalibration
pub const MAX_HISTORICAL_TOTALS: usize = 20;

/// Largest accepted `history_window`
pub const MAX_HISTORY_WINDOW: usize = 1_000;

/// Tokens below which confidence is always low
pub const LOW_CONFIDENCE_TOKENS: u64 = 20;

/// Tokens at which confidence may become high
pub const HIGH_CONFIDENCE_TOKENS: u64 = 100;

/// Progress above which confidence is high regardless of rate stability
pub const HIGH_CONFIDENCE_PERCENT: f64 = 80.0;

/// Rate variance below which confidence is high
pub const STABLE_RATE_VARIANCE: f64 = 5.0;

/// Relative deviation from the recent mean that counts as a trend
pub const TREND_THRESHOLD: f64 = 0.2;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a progress estimator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEstimatorConfig {
    /// Initial guess at the total token count
    pub estimated_tokens: u64,
    /// Capacity of the snapshot and rate rings
    pub history_window: usize,
    /// Minimum gap between emitted reports
    pub update_interval: Duration,
}

impl Default for ProgressEstimatorConfig {
    fn default() -> Self {
        Self {
            estimated_tokens: 500,
            history_window: 10,
            update_interval: Duration::from_millis(500),
        }
    }
}

impl ProgressEstimatorConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial estimate
    #[must_use]
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Set the ring capacity
    #[must_use]
    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    /// Set the report throttle
    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Check values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero estimate or a
    /// history window of zero or above [`MAX_HISTORY_WINDOW`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.estimated_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "estimator.estimated_tokens must be at least 1".to_string(),
            ));
        }
        if self.history_window == 0 {
            return Err(ConfigError::ValidationError(
                "estimator.history_window must be at least 1".to_string(),
            ));
        }
        if self.history_window > MAX_HISTORY_WINDOW {
            return Err(ConfigError::ValidationError(format!(
                "estimator.history_window ({}) exceeds {MAX_HISTORY_WINDOW}",
                self.history_window
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Reports
// ============================================================================

/// One point-in-time observation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    /// When it was taken
    pub timestamp: Instant,
    /// Cumulative tokens at `timestamp`
    pub tokens_count: u64,
    /// Time since the stream started
    pub elapsed: Duration,
    /// Rate since the previous snapshot (or stream start)
    pub tokens_per_second: f64,
}

/// How far an estimate can be trusted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Too few tokens to say anything
    Low,
    /// Some evidence, rate not yet settled
    Medium,
    /// Plenty of evidence and a stable rate or nearly done
    High,
}

/// Direction of the latest rate compared to the recent mean
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// More than 20% above the recent mean
    Increasing,
    /// More than 20% below the recent mean
    Decreasing,
    /// Within 20% of the recent mean
    Stable,
}

/// Client-facing progress report
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Tokens produced so far
    pub tokens_sent: u64,
    /// Current estimate of the total
    pub estimated_total: u64,
    /// `tokens_sent / estimated_total`, within [0, 100]
    pub percentage: f64,
    /// Seconds left at the smoothed rate; `None` when the rate is unknown
    pub remaining_seconds: Option<f64>,
    /// Seconds since the stream started
    pub elapsed_seconds: f64,
    /// Most recent instantaneous rate
    pub current_rate: f64,
    /// Weighted recent rate
    pub smoothed_rate: f64,
    /// Trust in the estimate
    pub confidence: Confidence,
    /// Rate direction
    pub trend: Trend,
    /// Whether this is the final report of the stream
    pub complete: bool,
}

// ============================================================================
// Estimator
// ============================================================================

/// Heuristic completion estimator for one stream at a time
///
/// The estimator is owned by a single stream handler. Completed streams feed
/// their totals back into the estimate of later streams, so an estimator can
/// be reused with [`reset`](Self::reset).
#[derive(Debug)]
pub struct ProgressEstimator {
    config: ProgressEstimatorConfig,
    strategy: Box<dyn EstimateStrategy>,
    estimate: f64,
    tokens_sent: u64,
    start_time: Instant,
    snapshots: VecDeque<ProgressSnapshot>,
    rates: VecDeque<f64>,
    historical: VecDeque<u64>,
    last_report_at: Option<Instant>,
    completed: bool,
}

impl ProgressEstimator {
    /// Create an estimator using the generic strategy
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is unusable.
    pub fn new(config: ProgressEstimatorConfig) -> Result<Self, ConfigError> {
        Self::with_strategy(config, Box::new(GenericBlend))
    }

    /// Create an estimator for `model`, using its profile when one exists
    ///
    /// Unknown models get the generic strategy and the configured seed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration or the
    /// matched profile is unusable.
    pub fn for_model(
        config: ProgressEstimatorConfig,
        model: &str,
        profiles: &ModelProfiles,
    ) -> Result<Self, ConfigError> {
        match profiles.get(model) {
            Some(profile) => {
                profile.validate(model)?;
                tracing::debug!(
                    model,
                    avg_tokens = profile.avg_tokens,
                    rate_profile = ?profile.rate_profile,
                    "Using model profile"
                );
                Self::with_strategy(config, Box::new(ModelSpecific::new(profile.clone())))
            }
            None => {
                tracing::debug!(model, "No model profile, using generic estimate");
                Self::new(config)
            }
        }
    }

    /// Create an estimator with a custom strategy
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is unusable.
    pub fn with_strategy(
        config: ProgressEstimatorConfig,
        strategy: Box<dyn EstimateStrategy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let estimate = strategy.initial_estimate(config.estimated_tokens);
        let window = config.history_window;
        Ok(Self {
            config,
            strategy,
            estimate,
            tokens_sent: 0,
            start_time: Instant::now(),
            snapshots: VecDeque::with_capacity(window),
            rates: VecDeque::with_capacity(window),
            historical: VecDeque::with_capacity(MAX_HISTORICAL_TOTALS),
            last_report_at: None,
            completed: false,
        })
    }

    /// Seed the totals of previously completed streams (most recent last)
    #[must_use]
    pub fn with_history(mut self, totals: impl IntoIterator<Item = u64>) -> Self {
        for total in totals {
            self.push_historical(total);
        }
        self
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &ProgressEstimatorConfig {
        &self.config
    }

    /// Name of the estimate strategy
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Tokens recorded for the current stream
    #[must_use]
    pub fn tokens_sent(&self) -> u64 {
        self.tokens_sent
    }

    /// Current estimate of the total
    #[must_use]
    pub fn estimated_tokens(&self) -> f64 {
        self.estimate
    }

    /// Totals of completed streams, oldest first
    #[must_use]
    pub fn historical_totals(&self) -> Vec<u64> {
        self.historical.iter().copied().collect()
    }

    /// Snapshots currently in the ring, oldest first
    #[must_use]
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.snapshots.iter().copied().collect()
    }

    /// Whether [`complete`](Self::complete) has been called for this stream
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Record `tokens` new tokens
    ///
    /// Returns a report unless one was emitted less than `update_interval`
    /// ago. The first update of a stream always reports. Does nothing once the
    /// stream is complete.
    pub fn update(&mut self, tokens: u64) -> Option<ProgressReport> {
        if self.completed {
            return None;
        }
        self.tokens_sent = self.tokens_sent.saturating_add(tokens);

        let now = Instant::now();
        if let Some(last) = self.last_report_at {
            if now.saturating_duration_since(last) < self.config.update_interval {
                return None;
            }
        }

        self.take_snapshot(now);
        self.estimate = self.strategy.refine(&EstimateContext {
            estimate: self.estimate,
            tokens_sent: self.tokens_sent,
            rates: &self.rates,
            smoothed_rate: smoothed(&self.rates),
            historical: &self.historical,
            history_window: self.config.history_window,
        });
        self.last_report_at = Some(now);

        let report = self.build_report(now);
        tracing::trace!(
            tokens_sent = report.tokens_sent,
            percentage = report.percentage,
            confidence = ?report.confidence,
            "Progress update"
        );
        Some(report)
    }

    /// Unthrottled report from the current state, without taking a snapshot
    #[must_use]
    pub fn report(&self) -> ProgressReport {
        self.build_report(Instant::now())
    }

    /// Finish the stream and return a final 100% report
    ///
    /// The stream total is added to the historical totals (the oldest is
    /// dropped past [`MAX_HISTORICAL_TOTALS`]). Calling it again returns the
    /// same final report without recording the total twice.
    #[allow(clippy::cast_precision_loss)]
    pub fn complete(&mut self) -> ProgressReport {
        if !self.completed {
            self.completed = true;
            self.estimate = self.tokens_sent as f64;
            self.push_historical(self.tokens_sent);
            tracing::debug!(
                tokens_sent = self.tokens_sent,
                elapsed_secs = self.start_time.elapsed().as_secs_f64(),
                "Stream progress complete"
            );
        }
        self.build_report(Instant::now())
    }

    /// Start a new stream, keeping the historical totals
    pub fn reset(&mut self) {
        self.estimate = self.strategy.initial_estimate(self.config.estimated_tokens);
        self.tokens_sent = 0;
        self.start_time = Instant::now();
        self.snapshots.clear();
        self.rates.clear();
        self.last_report_at = None;
        self.completed = false;
    }

    fn push_historical(&mut self, total: u64) {
        if self.historical.len() == MAX_HISTORICAL_TOTALS {
            self.historical.pop_front();
        }
        self.historical.push_back(total);
    }

    fn take_snapshot(&mut self, now: Instant) {
        let (prev_time, prev_tokens) = self
            .snapshots
            .back()
            .map_or((self.start_time, 0), |s| (s.timestamp, s.tokens_count));

        let dt = now.saturating_duration_since(prev_time).as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let tokens_per_second = if dt > 0.0 {
            self.tokens_sent.saturating_sub(prev_tokens) as f64 / dt
        } else {
            0.0
        };

        if self.snapshots.len() == self.config.history_window {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(ProgressSnapshot {
            timestamp: now,
            tokens_count: self.tokens_sent,
            elapsed: now.saturating_duration_since(self.start_time),
            tokens_per_second,
        });

        if self.rates.len() == self.config.history_window {
            self.rates.pop_front();
        }
        self.rates.push_back(tokens_per_second);
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn build_report(&self, now: Instant) -> ProgressReport {
        let sent = self.tokens_sent as f64;
        let percentage = if self.completed || self.estimate <= 0.0 {
            100.0
        } else {
            (sent / self.estimate * 100.0).clamp(0.0, 100.0)
        };

        let current_rate = self.rates.back().copied().unwrap_or(0.0);
        let smoothed_rate = smoothed(&self.rates);
        let remaining_seconds = if self.completed {
            Some(0.0)
        } else if smoothed_rate > 0.0 {
            Some((self.estimate - sent).max(0.0) / smoothed_rate)
        } else {
            None
        };

        ProgressReport {
            tokens_sent: self.tokens_sent,
            estimated_total: self.estimate.max(0.0).round() as u64,
            percentage,
            remaining_seconds,
            elapsed_seconds: now.saturating_duration_since(self.start_time).as_secs_f64(),
            current_rate,
            smoothed_rate,
            confidence: self.confidence(percentage),
            trend: self.trend(),
            complete: self.completed,
        }
    }

    fn confidence(&self, percentage: f64) -> Confidence {
        if self.tokens_sent < LOW_CONFIDENCE_TOKENS {
            return Confidence::Low;
        }
        if self.tokens_sent < HIGH_CONFIDENCE_TOKENS {
            return Confidence::Medium;
        }
        let stable = variance(tail(&self.rates, STABILITY_WINDOW))
            .is_some_and(|v| v < STABLE_RATE_VARIANCE);
        if percentage > HIGH_CONFIDENCE_PERCENT || stable {
            Confidence::High
        } else {
            Confidence::Medium
        }
    }

    fn trend(&self) -> Trend {
        let Some(&latest) = self.rates.back() else {
            return Trend::Stable;
        };
        let Some(avg) = mean(tail(&self.rates, SLOWDOWN_WINDOW)) else {
            return Trend::Stable;
        };
        if avg <= 0.0 {
            return Trend::Stable;
        }
        if latest > avg * (1.0 + TREND_THRESHOLD) {
            Trend::Increasing
        } else if latest < avg * (1.0 - TREND_THRESHOLD) {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
