//! Connection Registry Implementation
//!
//! Single source of truth for active streams. Owns creation, heartbeat,
//! metrics updates and eviction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::cleanup::CleanupTask;
use super::connection::{MetricsUpdate, StreamConnection, StreamId};
use crate::config::ConfigError;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the connection registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum simultaneously active streams per user
    pub max_connections_per_user: usize,
    /// Idle time after which the cleanup sweep disconnects a stream
    pub connection_timeout: Duration,
    /// Time between cleanup sweeps
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 5,
            connection_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-user connection limit
    #[must_use]
    pub fn with_max_connections_per_user(mut self, max: usize) -> Self {
        self.max_connections_per_user = max;
        self
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the sweep interval
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Check that every limit is usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero limit or a zero
    /// timeout/interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_user == 0 {
            return Err(ConfigError::ValidationError(
                "registry.max_connections_per_user must be at least 1".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "registry.connection_timeout must be positive".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "registry.cleanup_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time view of the registry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Connections held by the registry
    pub total_connections: usize,
    /// Connections with `is_active = true`
    pub active_connections: usize,
    /// Users with at least one connection
    pub unique_users: usize,
    /// Sum of `tokens_sent` across connections
    pub total_tokens_sent: u64,
    /// Connection count by user
    pub per_user_counts: HashMap<String, usize>,
}

// ============================================================================
// Registry
// ============================================================================

/// The two indexed collections, always mutated together under one lock
#[derive(Debug, Default)]
pub(crate) struct RegistryInner {
    connections: HashMap<StreamId, StreamConnection>,
    /// Per-user streams ordered by `(connected_at, admission_seq)`
    by_user: HashMap<String, BTreeSet<(Instant, u64, StreamId)>>,
    next_seq: u64,
}

impl RegistryInner {
    fn insert(&mut self, conn: StreamConnection) {
        self.by_user
            .entry(conn.user_id.clone())
            .or_default()
            .insert((conn.connected_at, conn.admission_seq, conn.stream_id.clone()));
        self.connections.insert(conn.stream_id.clone(), conn);
    }

    fn remove(&mut self, stream_id: &StreamId) -> Option<StreamConnection> {
        let mut conn = self.connections.remove(stream_id)?;
        if let Some(set) = self.by_user.get_mut(&conn.user_id) {
            set.remove(&(conn.connected_at, conn.admission_seq, conn.stream_id.clone()));
            if set.is_empty() {
                self.by_user.remove(&conn.user_id);
            }
        }
        conn.is_active = false;
        Some(conn)
    }

    fn oldest_for_user(&self, user_id: &str) -> Option<StreamId> {
        self.by_user
            .get(user_id)
            .and_then(|set| set.iter().next())
            .map(|(_, _, id)| id.clone())
    }

    fn count_for_user(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, BTreeSet::len)
    }

    /// Remove every connection idle for longer than `timeout` at `now`
    pub(crate) fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<StreamConnection> {
        let expired: Vec<StreamId> = self
            .connections
            .values()
            .filter(|conn| conn.idle_for(now) > timeout)
            .map(|conn| conn.stream_id.clone())
            .collect();

        expired.iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// One sweep pass, shared by [`ConnectionRegistry::sweep_expired`] and the
/// background task
///
/// The lock is released before the removed streams are logged.
pub(crate) fn sweep_and_log(
    inner: &Mutex<RegistryInner>,
    timeout: Duration,
) -> Vec<StreamConnection> {
    let removed = inner.lock().sweep(Instant::now(), timeout);
    for conn in &removed {
        tracing::info!(
            stream_id = %conn.stream_id,
            user_id = %conn.user_id,
            "Stream timed out"
        );
    }
    removed
}

/// Registry of active client streams
///
/// Cheap to clone; clones share the same state. Every mutating operation runs
/// under a single registry-wide mutex, and the lock is never held across an
/// `.await`, so the registry can be called from many stream handlers at once.
///
/// Not-found conditions (unknown or already-expired streams) are reported
/// with `None`/`false`, never as errors.
#[derive(Clone)]
pub struct ConnectionRegistry {
    config: Arc<RegistryConfig>,
    inner: Arc<Mutex<RegistryInner>>,
    cleanup: Arc<Mutex<Option<CleanupTask>>>,
}

impl ConnectionRegistry {
    /// Create a registry
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is unusable.
    pub fn new(config: RegistryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            cleanup: Arc::new(Mutex::new(None)),
        })
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a new stream for `user_id`
    ///
    /// Generates a stream ID when `stream_id` is `None`. When the user is
    /// already at `max_connections_per_user`, the oldest connection (by
    /// `connected_at`, then admission order) is disconnected first.
    ///
    /// Re-using an ID that is still registered replaces the old record; the
    /// new one carries `reconnect_count + 1` and starts with an empty
    /// partial response.
    pub fn connect(
        &self,
        user_id: &str,
        session_id: &str,
        stream_id: Option<StreamId>,
    ) -> StreamConnection {
        let stream_id = stream_id.unwrap_or_else(StreamId::generate);
        let mut inner = self.inner.lock();

        let reconnect_count = match inner.remove(&stream_id) {
            Some(previous) => {
                tracing::info!(
                    stream_id = %stream_id,
                    user_id = %previous.user_id,
                    "Stream reconnected, replacing previous record"
                );
                previous.reconnect_count + 1
            }
            None => 0,
        };

        while inner.count_for_user(user_id) >= self.config.max_connections_per_user {
            let Some(oldest) = inner.oldest_for_user(user_id) else {
                break;
            };
            if let Some(evicted) = inner.remove(&oldest) {
                tracing::warn!(
                    stream_id = %evicted.stream_id,
                    user_id = %user_id,
                    limit = self.config.max_connections_per_user,
                    "Per-user connection limit reached, evicting oldest stream"
                );
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut conn =
            StreamConnection::new(stream_id, user_id.to_string(), session_id.to_string(), seq);
        conn.reconnect_count = reconnect_count;
        let snapshot = conn.clone();
        inner.insert(conn);

        tracing::info!(
            stream_id = %snapshot.stream_id,
            user_id = %user_id,
            session_id = %session_id,
            "Stream connected"
        );
        snapshot
    }

    /// Remove a stream
    ///
    /// Returns the final state of the connection (with `is_active = false`),
    /// or `None` if the stream is unknown. Calling it twice is harmless.
    pub fn disconnect(&self, stream_id: &StreamId) -> Option<StreamConnection> {
        let removed = self.inner.lock().remove(stream_id);
        match &removed {
            Some(conn) => tracing::info!(
                stream_id = %stream_id,
                user_id = %conn.user_id,
                tokens_sent = conn.tokens_sent,
                "Stream disconnected"
            ),
            None => tracing::debug!(stream_id = %stream_id, "Disconnect for unknown stream"),
        }
        removed
    }

    /// Refresh the idle timer of a stream
    ///
    /// Returns false, without side effects, if the stream is not active.
    pub fn heartbeat(&self, stream_id: &StreamId) -> bool {
        let mut inner = self.inner.lock();
        match inner.connections.get_mut(stream_id) {
            Some(conn) if conn.is_active => {
                conn.last_ping = conn.last_ping.max(Instant::now());
                tracing::trace!(stream_id = %stream_id, "Heartbeat");
                true
            }
            _ => {
                tracing::debug!(stream_id = %stream_id, "Heartbeat for unknown stream");
                false
            }
        }
    }

    /// Apply a metrics update to a stream
    ///
    /// Returns false if the stream is not active.
    pub fn update_metrics(&self, stream_id: &StreamId, update: MetricsUpdate) -> bool {
        let mut inner = self.inner.lock();
        match inner.connections.get_mut(stream_id) {
            Some(conn) if conn.is_active => {
                conn.apply(update);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of a single stream
    #[must_use]
    pub fn get(&self, stream_id: &StreamId) -> Option<StreamConnection> {
        self.inner.lock().connections.get(stream_id).cloned()
    }

    /// Snapshots of a user's streams, oldest first
    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<StreamConnection> {
        let inner = self.inner.lock();
        inner
            .by_user
            .get(user_id)
            .map(|set| {
                set.iter()
                    .filter_map(|(_, _, id)| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of registered streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Whether no streams are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    /// Point-in-time statistics
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            total_connections: inner.connections.len(),
            active_connections: inner.connections.values().filter(|c| c.is_active).count(),
            unique_users: inner.by_user.len(),
            total_tokens_sent: inner.connections.values().map(|c| c.tokens_sent).sum(),
            per_user_counts: inner
                .by_user
                .iter()
                .map(|(user, set)| (user.clone(), set.len()))
                .collect(),
        }
    }

    /// Disconnect every stream idle for longer than `connection_timeout`
    ///
    /// This is what the background task runs every `cleanup_interval`.
    pub fn sweep_expired(&self) -> Vec<StreamConnection> {
        sweep_and_log(&self.inner, self.config.connection_timeout)
    }

    /// Start the background cleanup sweep
    ///
    /// Must be called from within a Tokio runtime. Calling it while the sweep
    /// is already running does nothing.
    pub fn start_cleanup(&self) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return;
        }
        *cleanup = Some(CleanupTask::spawn(
            Arc::clone(&self.inner),
            self.config.cleanup_interval,
            self.config.connection_timeout,
        ));
    }

    /// Whether the background sweep is running
    #[must_use]
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup.lock().is_some()
    }

    /// Stop the background sweep and wait for it to finish
    pub async fn shutdown(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("config", &self.config)
            .field("connections", &self.len())
            .field("cleanup_running", &self.is_cleanup_running())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
