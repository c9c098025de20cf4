//! Connection Registry - Active Stream Tracking
//!
//! The `ConnectionRegistry` is the single source of truth for every active
//! client stream. It:
//!
//! - Admits streams and enforces a per-user concurrency limit, evicting the
//!   oldest stream (by admission time) when a user is at the limit
//! - Refreshes idle timers on heartbeat
//! - Records per-stream token counts, partial output and metadata
//! - Sweeps out idle streams on a cancellable background task
//!
//! # Architecture
//!
//! ```text
//!                     ConnectionRegistry (Clone)
//!                ┌──────────────────────────────────────┐
//!                │ Arc<Mutex<RegistryInner>>            │
//!                │   connections: StreamId -> Conn      │
//!                │   by_user:     user -> {streams}     │
//!                └──────────────┬───────────────────────┘
//!                               │
//!         ┌─────────────────────┼─────────────────────┐
//!         │                     │                     │
//!   stream handler        stream handler        CleanupTask
//!   connect/heartbeat     update_metrics        sweep every
//!                                               cleanup_interval
//! ```
//!
//! # Thread Safety
//!
//! Both collections sit behind one `parking_lot::Mutex`, so `connect`,
//! `disconnect`, `heartbeat`, `update_metrics` and the sweep never interleave
//! their read-modify-write sequences. The lock is never held across an
//! `.await`.

mod cleanup;
mod connection;
mod connection_registry;

pub use connection::{
    InvalidStreamId, Metadata, MetricsUpdate, StreamConnection, StreamId, MAX_STREAM_ID_LEN,
};
pub use connection_registry::{ConnectionRegistry, RegistryConfig, RegistryStats};
