//! Estimate strategies
//!
//! A strategy owns the "how many tokens will this stream produce" question.
//! The estimator calls [`EstimateStrategy::refine`] once per emitted report
//! with the evidence collected so far.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use super::profile::{ModelProfile, RateProfile};

/// Tokens required before historical totals are blended in
pub const BLEND_MIN_TOKENS: u64 = 50;

/// Weight kept on the current estimate when blending with history
pub const CURRENT_WEIGHT: f64 = 0.7;

/// Rate samples inspected for a slowdown
pub const SLOWDOWN_WINDOW: usize = 5;

/// Drop (tokens/sec, first to last) that signals the stream is winding down
pub const SLOWDOWN_THRESHOLD: f64 = 2.0;

/// Fraction of the output assumed to remain once a slowdown is seen
pub const ASSUMED_REMAINING: f64 = 0.15;

/// Burst profiles are only capped below this many tokens
pub const BURST_MAX_TOKENS: u64 = 100;

/// Burst profiles are only capped above this smoothed rate (tokens/sec)
pub const BURST_MIN_RATE: f64 = 50.0;

/// Rate samples inspected for stability
pub const STABILITY_WINDOW: usize = 10;

/// Standard deviation below which a gradual stream counts as stable
pub const GRADUAL_MAX_STDEV: f64 = 2.0;

/// Response duration assumed for a stable gradual stream
pub const TYPICAL_DURATION: Duration = Duration::from_secs(30);

/// Evidence handed to a strategy
#[derive(Debug)]
pub struct EstimateContext<'a> {
    /// Estimate before this refinement
    pub estimate: f64,
    /// Tokens recorded so far
    pub tokens_sent: u64,
    /// Recent instantaneous rates, oldest first
    pub rates: &'a VecDeque<f64>,
    /// Weighted rate over `rates`
    pub smoothed_rate: f64,
    /// Totals of previously completed streams, oldest first
    pub historical: &'a VecDeque<u64>,
    /// Capacity of the rate ring
    pub history_window: usize,
}

/// Recomputes the total-token estimate
pub trait EstimateStrategy: Send + fmt::Debug {
    /// Estimate to start a stream with
    fn initial_estimate(&self, configured: u64) -> f64;

    /// Return the refined estimate
    fn refine(&self, ctx: &EstimateContext<'_>) -> f64;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

// ============================================================================
// Statistics helpers
// ============================================================================

/// The last `n` values in `values` (fewer if it is shorter)
pub(crate) fn tail(values: &VecDeque<f64>, n: usize) -> impl Iterator<Item = f64> + Clone + '_ {
    values.iter().skip(values.len().saturating_sub(n)).copied()
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Population variance; `None` with fewer than two samples
#[allow(clippy::cast_precision_loss)]
pub(crate) fn variance(values: impl Iterator<Item = f64> + Clone) -> Option<f64> {
    let n = values.clone().count();
    if n < 2 {
        return None;
    }
    let avg = mean(values.clone())?;
    Some(values.map(|v| (v - avg).powi(2)).sum::<f64>() / n as f64)
}

/// `0.5^i`-weighted mean, most recent sample weighted 1
pub(crate) fn smoothed(values: &VecDeque<f64>) -> f64 {
    let mut weight = 1.0;
    let mut weighted = 0.0;
    let mut total = 0.0;
    for rate in values.iter().rev() {
        weighted += rate * weight;
        total += weight;
        weight *= 0.5;
    }
    if total > 0.0 {
        weighted / total
    } else {
        0.0
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// History blend plus slowdown detection
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericBlend;

impl EstimateStrategy for GenericBlend {
    #[allow(clippy::cast_precision_loss)]
    fn initial_estimate(&self, configured: u64) -> f64 {
        configured as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn refine(&self, ctx: &EstimateContext<'_>) -> f64 {
        let mut estimate = ctx.estimate;

        if ctx.tokens_sent >= BLEND_MIN_TOKENS {
            let historical = mean(ctx.historical.iter().map(|&t| t as f64));
            if let Some(historical) = historical {
                estimate = CURRENT_WEIGHT * estimate + (1.0 - CURRENT_WEIGHT) * historical;
            }
        }

        if ctx.rates.len() >= SLOWDOWN_WINDOW {
            let recent: Vec<f64> = tail(ctx.rates, SLOWDOWN_WINDOW).collect();
            if recent[0] - recent[recent.len() - 1] > SLOWDOWN_THRESHOLD {
                estimate = ctx.tokens_sent as f64 / (1.0 - ASSUMED_REMAINING);
            }
        }

        estimate
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}

/// Generic estimation seeded and adjusted by a [`ModelProfile`]
#[derive(Clone, Debug)]
pub struct ModelSpecific {
    profile: ModelProfile,
    generic: GenericBlend,
}

impl ModelSpecific {
    /// Wrap a profile
    #[must_use]
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            generic: GenericBlend,
        }
    }

    /// The profile in use
    #[must_use]
    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    fn stable_rate(ctx: &EstimateContext<'_>) -> bool {
        let needed = STABILITY_WINDOW.min(ctx.history_window).max(2);
        if ctx.rates.len() < needed {
            return false;
        }
        variance(tail(ctx.rates, STABILITY_WINDOW)).is_some_and(|v| v.sqrt() < GRADUAL_MAX_STDEV)
    }
}

impl EstimateStrategy for ModelSpecific {
    #[allow(clippy::cast_precision_loss)]
    fn initial_estimate(&self, _configured: u64) -> f64 {
        self.profile.avg_tokens as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn refine(&self, ctx: &EstimateContext<'_>) -> f64 {
        match self.profile.rate_profile {
            RateProfile::Gradual if ctx.smoothed_rate > 0.0 && Self::stable_rate(ctx) => {
                ctx.smoothed_rate * TYPICAL_DURATION.as_secs_f64()
            }
            RateProfile::Burst => {
                let estimate = self.generic.refine(ctx);
                if ctx.tokens_sent < BURST_MAX_TOKENS && ctx.smoothed_rate > BURST_MIN_RATE {
                    let floor = self
                        .profile
                        .avg_tokens
                        .saturating_sub(self.profile.variance)
                        .max(ctx.tokens_sent);
                    estimate.min(floor as f64)
                } else {
                    estimate
                }
            }
            _ => self.generic.refine(ctx),
        }
    }

    fn name(&self) -> &'static str {
        match self.profile.rate_profile {
            RateProfile::Steady => "model_steady",
            RateProfile::Burst => "model_burst",
            RateProfile::Gradual => "model_gradual",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        estimate: f64,
        tokens_sent: u64,
        rates: &'a VecDeque<f64>,
        historical: &'a VecDeque<u64>,
    ) -> EstimateContext<'a> {
        EstimateContext {
            estimate,
            tokens_sent,
            rates,
            smoothed_rate: smoothed(rates),
            historical,
            history_window: 10,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_smoothed_weights_recent_samples() {
        let rates: VecDeque<f64> = [100.0, 200.0].into_iter().collect();
        assert!(close(smoothed(&rates), (200.0 + 50.0) / 1.5));

        let rates: VecDeque<f64> = [40.0, 80.0, 160.0].into_iter().collect();
        assert!(close(
            smoothed(&rates),
            (160.0 + 40.0 + 10.0) / 1.75
        ));
        assert!(close(smoothed(&VecDeque::new()), 0.0));
    }

    #[test]
    fn test_variance_needs_two_samples() {
        assert_eq!(variance([3.0].into_iter()), None);
        assert!(close(variance([1.0, 3.0].into_iter()).unwrap(), 1.0));
    }

    #[test]
    fn test_blend_needs_tokens_and_history() {
        let rates = VecDeque::new();
        let history: VecDeque<u64> = [1000].into_iter().collect();

        assert!(close(GenericBlend.refine(&ctx(500.0, 49, &rates, &history)), 500.0));
        assert!(close(GenericBlend.refine(&ctx(500.0, 50, &rates, &history)), 650.0));
        assert!(close(
            GenericBlend.refine(&ctx(500.0, 50, &rates, &VecDeque::new())),
            500.0
        ));
    }

    #[test]
    fn test_slowdown_assumes_fifteen_percent_left() {
        let history = VecDeque::new();
        let slowing: VecDeque<f64> = [10.0, 9.0, 9.0, 8.0, 7.0].into_iter().collect();
        assert!(close(
            GenericBlend.refine(&ctx(500.0, 85, &slowing, &history)),
            100.0
        ));

        // A 2 tok/s drop is not enough
        let flat: VecDeque<f64> = [10.0, 9.0, 9.0, 8.0, 8.0].into_iter().collect();
        assert!(close(GenericBlend.refine(&ctx(500.0, 85, &flat, &history)), 500.0));
    }

    #[test]
    fn test_burst_caps_short_fast_streams() {
        let strategy = ModelSpecific::new(ModelProfile::new(300, 100, RateProfile::Burst));
        let history = VecDeque::new();
        let fast: VecDeque<f64> = [200.0].into_iter().collect();
        let slow: VecDeque<f64> = [20.0].into_iter().collect();

        assert!(close(strategy.initial_estimate(500), 300.0));
        assert!(close(strategy.refine(&ctx(300.0, 20, &fast, &history)), 200.0));
        assert!(close(strategy.refine(&ctx(300.0, 20, &slow, &history)), 300.0));
        // Never below what was already sent
        assert!(close(strategy.refine(&ctx(300.0, 250, &fast, &history)), 300.0));
        assert!(close(strategy.refine(&ctx(150.0, 90, &fast, &history)), 150.0));
    }

    #[test]
    fn test_gradual_overrides_blend_once_stable() {
        let strategy = ModelSpecific::new(ModelProfile::new(1000, 0, RateProfile::Gradual));
        let history: VecDeque<u64> = [5000].into_iter().collect();

        let nine: VecDeque<f64> = std::iter::repeat(100.0).take(9).collect();
        let generic = strategy.refine(&ctx(1000.0, 90, &nine, &history));
        assert!(close(generic, 0.7 * 1000.0 + 0.3 * 5000.0));

        let ten: VecDeque<f64> = std::iter::repeat(100.0).take(10).collect();
        assert!(close(strategy.refine(&ctx(1000.0, 100, &ten, &history)), 3000.0));

        let jittery: VecDeque<f64> = (0..10).map(|i| if i % 2 == 0 { 95.0 } else { 105.0 }).collect();
        assert!(close(
            strategy.refine(&ctx(1000.0, 100, &jittery, &VecDeque::new())),
            1000.0
        ));
    }
}
