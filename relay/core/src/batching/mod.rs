//! Token Batching
//!
//! Tokens arrive one at a time from a generator. Sending each one as its own
//! frame wastes network round trips; holding them too long hurts perceived
//! latency. The `TokenBatcher` sits between the two:
//!
//! ```text
//!   generator ──add_token──▶ ┌──────────────┐ ──Some(batch)──▶ caller
//!                            │ TokenBatcher │
//!                            │  buffer      │
//!                            │  timer       │ ──timed batch──▶ mpsc receiver
//!                            └──────┬───────┘
//!                                   │ BatchSample after every flush
//!                                   ▼
//!                           BatchSizeStrategy
//!                        (fixed | adaptive hysteresis)
//! ```
//!
//! A batch is flushed when the buffer reaches the current batch size, when it
//! reaches `max_buffer_size`, when the delayed-flush timer fires, or on an
//! explicit [`TokenBatcher::flush`].

mod batcher;
mod strategy;

pub use batcher::{BatcherConfig, BatcherStats, FlushTrigger, TokenBatch, TokenBatcher};
pub use strategy::{
    AdaptiveBatchSize, AdaptiveConfig, Adjustment, BatchSample, BatchSizeStrategy,
    FixedBatchSize, HIGH_LATENCY, LOW_LATENCY, MAX_ADAPTATION_INTERVAL, MAX_BATCH_LIMIT,
    MIN_GROWTH_THROUGHPUT,
};
