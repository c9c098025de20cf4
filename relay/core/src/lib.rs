//! Relay Core - Streaming Delivery Engine
//!
//! This crate decides *when* and *how* partial model output reaches a client
//! during a long streaming response. It never touches the wire: the caller
//! feeds it tokens and forwards whatever it emits to its own transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  Inference backend (external)                    │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ token, token, token ...
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                         RELAY CORE                               │
//! │                               ▼                                  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                     StreamPipeline                         │  │
//! │  │  ┌──────────────────┐  ┌──────────────┐  ┌──────────────┐  │  │
//! │  │  │ConnectionRegistry│  │ TokenBatcher │  │  Progress    │  │  │
//! │  │  │ (shared, Clone)  │  │ + strategy   │  │  Estimator   │  │  │
//! │  │  └──────────────────┘  └──────┬───────┘  └──────┬───────┘  │  │
//! │  └───────────────────────────────┼─────────────────┼──────────┘  │
//! │                                  │ TokenBatch      │ Report      │
//! └──────────────────────────────────┼─────────────────┼─────────────┘
//!                                    ▼                 ▼
//!                          Transport layer (external, SSE etc.)
//! ```
//!
//! # Key Types
//!
//! - [`ConnectionRegistry`]: every active stream, per-user limits, idle sweep
//! - [`TokenBatcher`]: size/time bounded batching with pluggable sizing
//! - [`ProgressEstimator`]: throttled, confidence-rated completion reports
//! - [`StreamPipeline`]: the three components wired together for one stream
//! - [`RelayConfig`]: configuration loaded from TOML, environment and CLI
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{ConnectionRegistry, RelayConfig, StreamPipeline, StreamRequest};
//!
//! let config = relay_core::config::load_config()?;
//! let registry = ConnectionRegistry::new(config.registry.clone())?;
//! registry.start_cleanup();
//!
//! let mut pipeline = StreamPipeline::open(
//!     &registry,
//!     &config,
//!     StreamRequest::new("user-1", "session-1").with_model("llama3"),
//! )?;
//! for token in backend_tokens {
//!     let step = pipeline.push_token(&token);
//!     if let Some(batch) = step.batch { send(batch.content()); }
//!     if let Some(report) = step.progress { send_json(&report); }
//! }
//! let finished = pipeline.finish();
//! registry.shutdown().await;
//! ```
//!
//! # Module Overview
//!
//! - [`registry`]: connection records and the registry
//! - [`batching`]: token batcher and batch-size strategies
//! - [`progress`]: progress estimator, estimate strategies and model profiles
//! - [`pipeline`]: per-stream composition
//! - [`config`]: configuration loading

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batching;
pub mod config;
pub mod pipeline;
pub mod progress;
pub mod registry;

pub use batching::{
    AdaptiveBatchSize, AdaptiveConfig, BatchSizeStrategy, BatcherConfig, BatcherStats,
    FixedBatchSize, FlushTrigger, TokenBatch, TokenBatcher,
};
pub use config::{ConfigError, ConfigOverrides, ConfigSource, RelayConfig};
pub use pipeline::{FinishedStream, PipelineStep, StreamPipeline, StreamRequest};
pub use progress::{
    CompletionHistory, Confidence, ModelProfile, ModelProfiles, ProgressEstimator,
    ProgressEstimatorConfig, ProgressReport, RateProfile, Trend,
};
pub use registry::{
    ConnectionRegistry, MetricsUpdate, RegistryConfig, RegistryStats, StreamConnection, StreamId,
};
