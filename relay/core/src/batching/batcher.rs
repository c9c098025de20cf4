//! Token Batcher Implementation
//!
//! Groups generated tokens into batches bounded by size and by time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::strategy::{
    AdaptiveBatchSize, AdaptiveConfig, BatchSample, BatchSizeStrategy, FixedBatchSize,
    MAX_BATCH_LIMIT,
};
use crate::config::ConfigError;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a token batcher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Flush as soon as this many tokens are buffered
    pub batch_size: usize,
    /// Longest a token may wait in the buffer before a delayed flush
    pub batch_timeout: Duration,
    /// Hard cap on buffered tokens; hitting it forces a flush and logs a warning
    pub max_buffer_size: usize,
    /// Adaptive sizing bounds; `None` keeps `batch_size` fixed
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_timeout: Duration::from_millis(50),
            max_buffer_size: 100,
            adaptive: Some(AdaptiveConfig::default()),
        }
    }
}

impl BatcherConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fixed-size configuration (no adaptation)
    #[must_use]
    pub fn fixed(batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            batch_size,
            batch_timeout,
            adaptive: None,
            ..Default::default()
        }
    }

    /// Set the flush threshold
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the delayed-flush timeout
    #[must_use]
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Set the hard buffer cap
    #[must_use]
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Enable adaptive sizing with the given bounds
    #[must_use]
    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Disable adaptive sizing
    #[must_use]
    pub fn without_adaptive(mut self) -> Self {
        self.adaptive = None;
        self
    }

    /// Check thresholds
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for zero sizes, sizes above
    /// [`MAX_BATCH_LIMIT`], a zero timeout, invalid adaptive bounds, or a
    /// `batch_size` outside them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batcher.batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size > MAX_BATCH_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "batcher.batch_size ({}) exceeds {MAX_BATCH_LIMIT}",
                self.batch_size
            )));
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "batcher.max_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.max_buffer_size > MAX_BATCH_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "batcher.max_buffer_size ({}) exceeds {MAX_BATCH_LIMIT}",
                self.max_buffer_size
            )));
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "batcher.batch_timeout must be positive".to_string(),
            ));
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate()?;
            if !(adaptive.min_batch_size..=adaptive.max_batch_size).contains(&self.batch_size) {
                return Err(ConfigError::ValidationError(format!(
                    "batcher.batch_size ({}) must lie within [{}, {}]",
                    self.batch_size, adaptive.min_batch_size, adaptive.max_batch_size
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Why a batch was flushed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// The buffer reached the batch size
    Size,
    /// The buffer reached `max_buffer_size`
    BufferLimit,
    /// The delayed-flush timer fired
    Timeout,
    /// [`TokenBatcher::flush`] was called
    Manual,
}

/// An immutable group of tokens ready for transmission
#[derive(Clone, Debug, PartialEq)]
pub struct TokenBatch {
    tokens: Vec<String>,
    timestamp: Instant,
    batch_number: u64,
    trigger: FlushTrigger,
}

impl TokenBatch {
    /// Tokens in arrival order
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Number of tokens
    #[must_use]
    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    /// Tokens concatenated in order
    #[must_use]
    pub fn content(&self) -> String {
        self.tokens.concat()
    }

    /// When the batch was flushed
    #[must_use]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Position of this batch in the batcher's output, starting at 1
    #[must_use]
    pub fn batch_number(&self) -> u64 {
        self.batch_number
    }

    /// What caused the flush
    #[must_use]
    pub fn trigger(&self) -> FlushTrigger {
        self.trigger
    }

    /// Take ownership of the tokens
    #[must_use]
    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }
}

/// Batcher counters and thresholds
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatcherStats {
    /// Tokens emitted in batches so far
    pub total_tokens: u64,
    /// Batches emitted so far
    pub total_batches: u64,
    /// `total_tokens / total_batches`, 0 before the first batch
    pub average_batch_size: f64,
    /// Tokens currently waiting in the buffer
    pub buffered_tokens: usize,
    /// Current flush threshold (may differ from the configured one when adaptive)
    pub batch_size: usize,
    /// Configured delayed-flush timeout
    pub batch_timeout: Duration,
    /// Configured buffer cap
    pub max_buffer_size: usize,
    /// Times the buffer cap forced a flush
    pub buffer_limit_hits: u64,
    /// Name of the batch-size strategy
    pub strategy: &'static str,
}

// ============================================================================
// Batcher
// ============================================================================

struct BatcherState {
    buffer: Vec<String>,
    first_token_at: Option<Instant>,
    last_flush_at: Instant,
    batch_size: usize,
    batch_count: u64,
    total_tokens: u64,
    buffer_limit_hits: u64,
    /// Bumped on every flush; a timer armed under an older value is stale
    generation: u64,
    timer: Option<AbortHandle>,
    strategy: Box<dyn BatchSizeStrategy>,
}

impl BatcherState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn take_batch(&mut self, trigger: FlushTrigger, now: Instant) -> Option<TokenBatch> {
        self.generation += 1;
        self.cancel_timer();

        if self.buffer.is_empty() {
            return None;
        }

        let tokens = std::mem::take(&mut self.buffer);
        let size = tokens.len();
        self.batch_count += 1;
        self.total_tokens += size as u64;

        let since_last = now.saturating_duration_since(self.last_flush_at);
        #[allow(clippy::cast_precision_loss)]
        let throughput = if since_last.is_zero() {
            0.0
        } else {
            size as f64 / since_last.as_secs_f64()
        };
        let sample = BatchSample {
            size,
            latency: self
                .first_token_at
                .take()
                .map_or(Duration::ZERO, |t| now.saturating_duration_since(t)),
            throughput,
        };
        self.last_flush_at = now;

        let previous = self.batch_size;
        self.batch_size = self.strategy.observe(sample, previous);
        if self.batch_size != previous {
            tracing::info!(
                from = previous,
                to = self.batch_size,
                "Batch size adapted"
            );
        }

        tracing::trace!(
            batch_number = self.batch_count,
            size,
            trigger = ?trigger,
            "Batch flushed"
        );

        Some(TokenBatch {
            tokens,
            timestamp: now,
            batch_number: self.batch_count,
            trigger,
        })
    }
}

/// Groups tokens into batches for transmission
///
/// Batches are returned directly from [`add_token`](Self::add_token) and
/// [`flush`](Self::flush) when they are ready immediately. Batches produced by
/// the delayed-flush timer are delivered on the channel returned by
/// [`TokenBatcher::new`]. Batch numbers are shared across both paths, so
/// ordering all batches by number reproduces the input exactly.
///
/// The delayed flush runs on the current Tokio runtime. Without a runtime,
/// only size-triggered and manual flushes happen.
pub struct TokenBatcher {
    config: BatcherConfig,
    state: Arc<Mutex<BatcherState>>,
    timed_tx: mpsc::UnboundedSender<TokenBatch>,
}

impl TokenBatcher {
    /// Create a batcher with the strategy implied by `config.adaptive`
    ///
    /// Returns the batcher and the receiver for timer-flushed batches.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is unusable.
    pub fn new(
        config: BatcherConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TokenBatch>), ConfigError> {
        let strategy: Box<dyn BatchSizeStrategy> = match &config.adaptive {
            Some(adaptive) => Box::new(AdaptiveBatchSize::new(adaptive.clone())),
            None => Box::new(FixedBatchSize),
        };
        Self::with_strategy(config, strategy)
    }

    /// Create a batcher with a custom batch-size strategy
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is unusable.
    pub fn with_strategy(
        config: BatcherConfig,
        strategy: Box<dyn BatchSizeStrategy>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TokenBatch>), ConfigError> {
        config.validate()?;
        let (timed_tx, timed_rx) = mpsc::unbounded_channel();
        let state = BatcherState {
            buffer: Vec::with_capacity(config.batch_size.min(config.max_buffer_size)),
            first_token_at: None,
            last_flush_at: Instant::now(),
            batch_size: config.batch_size,
            batch_count: 0,
            total_tokens: 0,
            buffer_limit_hits: 0,
            generation: 0,
            timer: None,
            strategy,
        };
        Ok((
            Self {
                config,
                state: Arc::new(Mutex::new(state)),
                timed_tx,
            },
            timed_rx,
        ))
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Buffer one token
    ///
    /// Returns a batch if the buffer reached the batch size or the buffer
    /// cap. Otherwise arms the delayed flush (unless one is already pending)
    /// and returns `None`.
    pub fn add_token(&self, token: impl Into<String>) -> Option<TokenBatch> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.buffer.is_empty() {
            state.first_token_at = Some(now);
        }
        state.buffer.push(token.into());

        let buffered = state.buffer.len();
        if buffered >= state.batch_size {
            return state.take_batch(FlushTrigger::Size, now);
        }
        if buffered >= self.config.max_buffer_size {
            state.buffer_limit_hits += 1;
            tracing::warn!(
                buffered,
                max_buffer_size = self.config.max_buffer_size,
                "Token buffer limit reached, forcing flush"
            );
            return state.take_batch(FlushTrigger::BufferLimit, now);
        }

        if state.timer.is_none() {
            self.arm_timer(&mut state);
        }
        None
    }

    /// Flush whatever is buffered right now
    ///
    /// Returns `None` if the buffer is empty. Cancels any pending delayed flush.
    pub fn flush(&self) -> Option<TokenBatch> {
        self.state
            .lock()
            .take_batch(FlushTrigger::Manual, Instant::now())
    }

    /// Cancel the pending delayed flush, leaving buffered tokens in place
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.cancel_timer();
    }

    /// Whether a delayed flush is currently armed
    #[must_use]
    pub fn has_pending_timer(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    /// Current counters and thresholds
    #[must_use]
    pub fn stats(&self) -> BatcherStats {
        let state = self.state.lock();
        #[allow(clippy::cast_precision_loss)]
        let average_batch_size = if state.batch_count == 0 {
            0.0
        } else {
            state.total_tokens as f64 / state.batch_count as f64
        };
        BatcherStats {
            total_tokens: state.total_tokens,
            total_batches: state.batch_count,
            average_batch_size,
            buffered_tokens: state.buffer.len(),
            batch_size: state.batch_size,
            batch_timeout: self.config.batch_timeout,
            max_buffer_size: self.config.max_buffer_size,
            buffer_limit_hits: state.buffer_limit_hits,
            strategy: state.strategy.name(),
        }
    }

    fn arm_timer(&self, state: &mut BatcherState) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No Tokio runtime available, delayed flush disabled");
            return;
        };

        let generation = state.generation;
        let weak: Weak<Mutex<BatcherState>> = Arc::downgrade(&self.state);
        let timed_tx = self.timed_tx.clone();
        let timeout = self.config.batch_timeout;

        let handle = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(state) = weak.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;

            // Sent under the lock so a flush that follows always sees it queued
            if let Some(batch) = state.take_batch(FlushTrigger::Timeout, Instant::now()) {
                tracing::debug!(
                    batch_number = batch.batch_number(),
                    size = batch.size(),
                    "Delayed flush"
                );
                if timed_tx.send(batch).is_err() {
                    tracing::warn!("Batch receiver dropped, timed batch discarded");
                }
            }
        });
        state.timer = Some(handle.abort_handle());
    }
}

impl Drop for TokenBatcher {
    fn drop(&mut self) {
        self.state.lock().cancel_timer();
    }
}

impl std::fmt::Debug for TokenBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBatcher")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
