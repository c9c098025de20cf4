//! Simulated streams
//!
//! A [`SyntheticSource`] stands in for the inference backend. [`run_stream`]
//! drives one [`StreamPipeline`] from it, the way an SSE handler would drive
//! it from a real model.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use relay_core::{ConnectionRegistry, RelayConfig, StreamId, StreamPipeline, StreamRequest};

use crate::sse::{BatchFrame, DoneFrame, Frame, ProgressFrame};

const WORDS: &[&str] = &[
    "the", "stream", "of", "tokens", "arrives", "in", "small", "pieces", "while", "a", "model",
    "thinks", "about", "what", "comes", "next", "and", "every", "piece", "matters",
];

/// Seeded token generator with jittered pacing
#[derive(Debug)]
pub struct SyntheticSource {
    rng: StdRng,
    remaining: usize,
    base_delay: Duration,
}

impl SyntheticSource {
    /// Create a source of `tokens` tokens at roughly `rate` tokens per second
    ///
    /// A non-positive rate produces tokens without delay.
    #[must_use]
    pub fn new(seed: u64, tokens: usize, rate: f64) -> Self {
        let base_delay = if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            rng: StdRng::seed_from_u64(seed),
            remaining: tokens,
            base_delay,
        }
    }

    /// Tokens not yet produced
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Next token, or `None` once the source is exhausted
    pub fn next_token(&mut self) -> Option<String> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let word = WORDS.choose(&mut self.rng).copied().unwrap_or("token");
        let token = if self.remaining == 0 {
            format!("{word}.")
        } else if self.rng.gen_ratio(1, 12) {
            format!("{word}, ")
        } else {
            format!("{word} ")
        };
        Some(token)
    }

    /// Delay before the next token, between half and one and a half the base
    pub fn next_delay(&mut self) -> Duration {
        self.base_delay.mul_f64(self.rng.gen_range(0.5..1.5))
    }
}

/// Parameters of one simulated stream
#[derive(Clone, Debug)]
pub struct StreamPlan {
    /// Owning user
    pub user_id: String,
    /// Session name
    pub session_id: String,
    /// Model used to pick an estimate profile
    pub model: Option<String>,
    /// Tokens to generate
    pub tokens: usize,
    /// Tokens per second
    pub rate: f64,
    /// RNG seed
    pub seed: u64,
    /// Client heartbeat period
    pub heartbeat: Duration,
}

/// How a simulated stream ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    /// Stream ID assigned by the registry
    pub stream_id: StreamId,
    /// Tokens generated
    pub tokens: u64,
    /// Batches delivered
    pub batches: u64,
    /// Stopped by the shutdown signal
    pub interrupted: bool,
    /// Lost its registry entry before finishing
    pub evicted: bool,
}

async fn emit(frames: &mpsc::Sender<Frame>, frame: Frame) -> Result<()> {
    frames
        .send(frame)
        .await
        .map_err(|_| anyhow::anyhow!("Frame writer stopped"))
}

/// Run one stream to completion, eviction or shutdown
///
/// # Errors
///
/// Returns an error if the pipeline cannot be opened or the frame writer
/// goes away.
pub async fn run_stream(
    registry: ConnectionRegistry,
    config: RelayConfig,
    plan: StreamPlan,
    frames: mpsc::Sender<Frame>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<StreamSummary> {
    let mut request = StreamRequest::new(&plan.user_id, &plan.session_id);
    if let Some(model) = &plan.model {
        request = request.with_model(model.clone());
    }
    let mut pipeline = StreamPipeline::open(&registry, &config, request)
        .with_context(|| format!("Failed to open stream for {}", plan.user_id))?;
    let stream_id = pipeline.stream_id().clone();

    info!(
        stream_id = %stream_id,
        user_id = %plan.user_id,
        tokens = plan.tokens,
        strategy = pipeline.estimator().strategy_name(),
        "Stream started"
    );

    let mut source = SyntheticSource::new(plan.seed, plan.tokens, plan.rate);
    let mut heartbeat = interval_at(Instant::now() + plan.heartbeat, plan.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut next_token_at = Instant::now() + source.next_delay();
    let mut batches = 0u64;
    let mut interrupted = false;
    let mut evicted = false;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    interrupted = true;
                    break;
                }
            }
            Some(batch) = pipeline.next_timed_batch() => {
                batches += 1;
                emit(&frames, Frame::Batch(BatchFrame::new(&stream_id, &batch))).await?;
            }
            _ = heartbeat.tick() => {
                if !pipeline.heartbeat() {
                    evicted = true;
                    break;
                }
            }
            () = sleep_until(next_token_at) => {
                let Some(token) = source.next_token() else {
                    break;
                };
                let step = pipeline.push_token(&token);
                if let Some(batch) = step.batch {
                    batches += 1;
                    emit(&frames, Frame::Batch(BatchFrame::new(&stream_id, &batch))).await?;
                }
                if let Some(report) = step.progress {
                    emit(
                        &frames,
                        Frame::Progress(ProgressFrame {
                            stream_id: stream_id.to_string(),
                            report,
                        }),
                    )
                    .await?;
                }
                if !step.connected {
                    evicted = true;
                    break;
                }
                next_token_at = Instant::now() + source.next_delay();
            }
        }
    }

    if evicted {
        warn!(stream_id = %stream_id, "Stream lost its registry entry");
    } else if interrupted {
        info!(
            stream_id = %stream_id,
            remaining = source.remaining(),
            "Stream interrupted"
        );
    }

    // Only streams that ran to the end calibrate later estimates
    let finished = if interrupted || evicted {
        pipeline.abort()
    } else {
        pipeline.finish()
    };
    for batch in &finished.batches {
        batches += 1;
        emit(&frames, Frame::Batch(BatchFrame::new(&stream_id, batch))).await?;
    }
    let tokens = finished.report.tokens_sent;
    emit(
        &frames,
        Frame::Progress(ProgressFrame {
            stream_id: stream_id.to_string(),
            report: finished.report,
        }),
    )
    .await?;
    emit(
        &frames,
        Frame::Done(DoneFrame {
            stream_id: stream_id.to_string(),
            tokens,
            batches,
            interrupted,
            evicted,
        }),
    )
    .await?;

    debug!(stream_id = %stream_id, tokens, batches, "Stream finished");

    Ok(StreamSummary {
        stream_id,
        tokens,
        batches,
        interrupted,
        evicted,
    })
}
