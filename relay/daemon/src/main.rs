//! Relay Daemon - Streaming Delivery Demo
//!
//! Runs a number of simulated model streams through `relay-core` and writes
//! every batch and progress report to stdout as SSE frames. Logs go to
//! stderr so the two can be separated.
//!
//! # Usage
//!
//! ```bash
//! # Four streams with defaults
//! relay-daemon
//!
//! # Sixteen fast streams, fixed batch size
//! relay-daemon --streams 16 --rate 200 --batch-size 8 --no-adaptive
//!
//! # With config file
//! relay-daemon --config /etc/relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon > frames.txt
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl+C): stop every stream, flush what is pending, exit

mod simulate;
mod sse;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use relay_core::config::load_config_from_path;
use relay_core::{ConfigOverrides, ConnectionRegistry};

use simulate::{run_stream, StreamPlan};
use sse::{write_frames, Frame};

/// Relay Daemon - simulated token streams through the delivery engine
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of concurrent streams
    #[arg(short = 'n', long, default_value_t = 4)]
    streams: usize,

    /// Distinct users the streams are spread over
    #[arg(short = 'u', long, default_value_t = 2)]
    users: usize,

    /// Tokens generated per stream
    #[arg(short = 't', long, default_value_t = 200)]
    tokens: usize,

    /// Tokens per second per stream
    #[arg(short = 'r', long, default_value_t = 40.0)]
    rate: f64,

    /// Model name for the progress estimate
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Base RNG seed; stream N uses seed + N
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Client heartbeat period in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Override the per-user connection limit
    #[arg(long)]
    max_connections_per_user: Option<usize>,

    /// Override the batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override the delayed-flush timeout in milliseconds
    #[arg(long)]
    batch_timeout_ms: Option<u64>,

    /// Use a fixed batch size instead of the adaptive strategy
    #[arg(long)]
    no_adaptive: bool,

    /// Override the seed estimate of tokens per response
    #[arg(long)]
    estimated_tokens: Option<u64>,

    /// Override the minimum interval between progress reports
    #[arg(long)]
    update_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(max) = self.max_connections_per_user {
            overrides = overrides.with_max_connections_per_user(max);
        }
        if let Some(size) = self.batch_size {
            overrides = overrides.with_batch_size(size);
        }
        if let Some(ms) = self.batch_timeout_ms {
            overrides = overrides.with_batch_timeout_ms(ms);
        }
        if self.no_adaptive {
            overrides = overrides.with_adaptive(false);
        }
        if let Some(tokens) = self.estimated_tokens {
            overrides = overrides.with_estimated_tokens(tokens);
        }
        if let Some(ms) = self.update_interval_ms {
            overrides = overrides.with_update_interval_ms(ms);
        }
        overrides
    }

    fn stream_plan(&self, index: usize) -> StreamPlan {
        StreamPlan {
            user_id: format!("user-{}", index % self.users.max(1)),
            session_id: format!("session-{index}"),
            model: self.model.clone(),
            tokens: self.tokens,
            rate: self.rate,
            seed: self.seed.wrapping_add(index as u64),
            heartbeat: Duration::from_millis(self.heartbeat_ms.max(1)),
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.rate.is_nan() || args.rate <= 0.0 {
        anyhow::bail!("--rate must be positive, got {}", args.rate);
    }

    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    let overrides = args.overrides();
    if !overrides.is_empty() {
        overrides.apply(&mut config);
        config
            .validate()
            .context("Invalid configuration after command-line overrides")?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.source(),
        streams = args.streams,
        tokens = args.tokens,
        rate = args.rate,
        "Relay daemon starting"
    );

    let registry =
        ConnectionRegistry::new(config.registry.clone()).context("Failed to create registry")?;
    registry.start_cleanup();

    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(1024);
    let writer = tokio::spawn(write_frames(frame_rx, tokio::io::stdout()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let streams = futures::future::join_all((0..args.streams).map(|index| {
        tokio::spawn(run_stream(
            registry.clone(),
            config.clone(),
            args.stream_plan(index),
            frame_tx.clone(),
            shutdown_rx.clone(),
        ))
    }));
    tokio::pin!(streams);

    let results = tokio::select! {
        results = &mut streams => results,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("Received Ctrl+C, stopping streams");
                    if shutdown_tx.send(true).is_err() {
                        debug!("Every stream had already finished");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
            }
            streams.await
        }
    };

    let mut completed = 0usize;
    let mut interrupted = 0usize;
    let mut evicted = 0usize;
    for result in results {
        match result {
            Ok(Ok(summary)) => {
                debug!(
                    stream_id = %summary.stream_id,
                    tokens = summary.tokens,
                    batches = summary.batches,
                    "Stream summary"
                );
                if summary.evicted {
                    evicted += 1;
                } else if summary.interrupted {
                    interrupted += 1;
                } else {
                    completed += 1;
                }
            }
            Ok(Err(e)) => error!(error = %e, "Stream failed"),
            Err(e) => error!(error = %e, "Stream task panicked"),
        }
    }

    let stats = registry.stats();
    if let Err(e) = frame_tx.send(Frame::Stats(stats.clone())).await {
        warn!(error = %e, "Failed to queue stats frame");
    }
    drop(frame_tx);

    registry.shutdown().await;

    match writer.await {
        Ok(Ok(frames)) => info!(frames, "Frame writer drained"),
        Ok(Err(e)) => error!(error = %e, "Frame writer failed"),
        Err(e) => error!(error = %e, "Frame writer task panicked"),
    }

    info!(
        completed,
        interrupted,
        evicted,
        remaining_connections = stats.total_connections,
        "Relay daemon stopped cleanly"
    );
    Ok(())
}
