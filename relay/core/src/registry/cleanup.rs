//! Background sweep that disconnects idle streams.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection_registry::{sweep_and_log, RegistryInner};

/// Handle to the running sweep task
///
/// Dropping the handle aborts the task; [`CleanupTask::stop`] stops it and
/// waits for it to exit.
pub(crate) struct CleanupTask {
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    pub(crate) fn spawn(
        inner: Arc<Mutex<RegistryInner>>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_secs = interval.as_secs_f64(),
                timeout_secs = timeout.as_secs_f64(),
                "Starting connection cleanup task"
            );

            // The first tick of an interval completes immediately; start one
            // period out so a fresh registry is not swept at startup.
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = stop_signal.notified() => break,
                    _ = ticker.tick() => {
                        let removed = sweep_and_log(&inner, timeout);
                        if !removed.is_empty() {
                            tracing::debug!(removed = removed.len(), "Cleanup sweep finished");
                        }
                    }
                }
            }

            tracing::info!("Connection cleanup task stopped");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the task and wait for it to finish
    pub(crate) async fn stop(mut self) {
        // notify_one stores a permit, so the signal is not lost if the task
        // is between select! iterations
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Cleanup task panicked");
                }
            }
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::{ConnectionRegistry, RegistryConfig};
    use std::time::Duration;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(
            RegistryConfig::new()
                .with_connection_timeout(Duration::from_secs(5))
                .with_cleanup_interval(Duration::from_secs(1)),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_streams() {
        let registry = registry();
        let idle = registry.connect("u1", "s", None);
        let busy = registry.connect("u1", "s", None);
        registry.start_cleanup();

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            registry.heartbeat(busy.stream_id());
        }

        assert!(registry.get(idle.stream_id()).is_none());
        assert!(registry.get(busy.stream_id()).is_some());
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_and_manual_sweeps_agree() {
        let manual = registry();
        let background = registry();
        let mut kept = Vec::new();
        for registry in [&manual, &background] {
            registry.connect("u1", "s", None);
            kept.push(registry.connect("u2", "s", None));
        }
        background.start_cleanup();

        for _ in 0..7 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            for conn in &kept {
                manual.heartbeat(conn.stream_id());
                background.heartbeat(conn.stream_id());
            }
        }

        let removed = manual.sweep_expired();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].user_id(), "u1");
        assert_eq!(manual.stats(), background.stats());
        assert!(background.sweep_expired().is_empty());
        background.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_cooperative() {
        let registry = ConnectionRegistry::new(
            RegistryConfig::new()
                .with_connection_timeout(Duration::from_secs(5))
                .with_cleanup_interval(Duration::from_secs(60)),
        )
        .unwrap();
        let conn = registry.connect("u1", "s", None);
        registry.start_cleanup();

        // Past the timeout but before the first sweep
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.get(conn.stream_id()).is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.get(conn.stream_id()).is_none());
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_sweep() {
        let registry = registry();
        registry.start_cleanup();
        assert!(registry.is_cleanup_running());

        registry.shutdown().await;
        assert!(!registry.is_cleanup_running());

        let conn = registry.connect("u1", "s", None);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.get(conn.stream_id()).is_some());
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_twice() {
        let registry = registry();
        registry.start_cleanup();
        registry.start_cleanup();
        registry.shutdown().await;
        registry.shutdown().await;
        assert!(!registry.is_cleanup_running());
    }
}
