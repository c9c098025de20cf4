//! Progress Estimation
//!
//! Clients watching a long stream want to know how far along it is, but the
//! true length is unknown until the model stops. The `ProgressEstimator`
//! keeps a running guess:
//!
//! ```text
//!   update(n) ──▶ throttle ──▶ snapshot ring ──▶ rate ring
//!                   │                              │
//!                   │ (< update_interval)          ▼
//!                   ▼                      EstimateStrategy::refine
//!                  None                    (generic | model profile)
//!                                                  │
//!                                                  ▼
//!                                  ProgressReport { percentage,
//!                                    remaining, confidence, trend }
//! ```
//!
//! Totals of completed streams are kept (last 20) and blended into the
//! estimate of the next stream once it has produced enough tokens. A
//! [`CompletionHistory`] carries them from one stream to the next.

mod estimator;
mod history;
mod profile;
mod strategy;

pub use estimator::{
    Confidence, ProgressEstimator, ProgressEstimatorConfig, ProgressReport, ProgressSnapshot,
    Trend, MAX_HISTORICAL_TOTALS, MAX_HISTORY_WINDOW,
};
pub use history::CompletionHistory;
pub use profile::{ModelProfile, ModelProfiles, RateProfile};
pub use strategy::{
    EstimateContext, EstimateStrategy, GenericBlend, ModelSpecific, TYPICAL_DURATION,
};
