//! Integration tests for the streaming-delivery engine
//!
//! These tests drive the public API the way a transport handler would.
//! Tests cover:
//! - Per-user limits with oldest-first eviction
//! - TOML configuration feeding every component
//! - Full streams through `StreamPipeline`, including timed batches
//! - Idle sweeps racing active streams
//! - Many concurrent streams sharing one registry

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::task::JoinSet;

use relay_core::config::load_config_with_env;
use relay_core::{
    Confidence, ConnectionRegistry, FlushTrigger, RegistryConfig, RelayConfig, StreamPipeline,
    StreamRequest, TokenBatch,
};

fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.batcher = config
        .batcher
        .with_batch_size(4)
        .with_batch_timeout(Duration::from_millis(20));
    config.estimator = config
        .estimator
        .with_estimated_tokens(40)
        .with_update_interval(Duration::from_millis(100));
    config
}

// =============================================================================
// Test 1: Oldest Stream Evicted At The Limit
// =============================================================================

#[tokio::test]
async fn test_third_stream_evicts_oldest() {
    let registry =
        ConnectionRegistry::new(RegistryConfig::new().with_max_connections_per_user(2)).unwrap();

    let a = registry.connect("u1", "s", None);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let b = registry.connect("u1", "s", None);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let c = registry.connect("u1", "s", None);

    assert!(registry.get(a.stream_id()).is_none());
    assert!(registry.get(b.stream_id()).is_some());
    assert!(registry.get(c.stream_id()).is_some());

    let stats = registry.stats();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.per_user_counts.get("u1"), Some(&2));

    // Other users are unaffected
    registry.connect("u2", "s", None);
    assert_eq!(registry.stats().unique_users, 2);
}

// =============================================================================
// Test 2: TOML Configuration Drives Components
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_toml_configuration_reaches_pipeline() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[registry]
max_connections_per_user = 1

[batcher]
batch_size = 2
batch_timeout_ms = 30
adaptive = false

[estimator]
estimated_tokens = 6
update_interval_ms = 0
"#,
    )
    .unwrap();

    let config = load_config_with_env(Some(file.path().to_path_buf()), |_| None).unwrap();
    let registry = ConnectionRegistry::new(config.registry.clone()).unwrap();

    let mut pipeline =
        StreamPipeline::open(&registry, &config, StreamRequest::new("u1", "s1")).unwrap();
    assert_eq!(pipeline.batcher().stats().strategy, "fixed");

    assert!(pipeline.push_token("a").batch.is_none());
    let step = pipeline.push_token("b");
    assert_eq!(step.batch.unwrap().content(), "ab");

    // Limit of one: a second stream evicts the first
    let _other =
        StreamPipeline::open(&registry, &config, StreamRequest::new("u1", "s2")).unwrap();
    assert!(!pipeline.push_token("c").connected);
}

// =============================================================================
// Test 3: A Full Stream Through The Pipeline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_stream_reassembles_in_order() {
    let registry = ConnectionRegistry::new(RegistryConfig::default()).unwrap();
    let config = fast_config();
    let mut pipeline =
        StreamPipeline::open(&registry, &config, StreamRequest::new("u1", "s1")).unwrap();

    let words: Vec<String> = (0..30).map(|i| format!("w{i} ")).collect();
    let mut batches: Vec<TokenBatch> = Vec::new();
    let mut reports = Vec::new();

    for (i, word) in words.iter().enumerate() {
        // A pause long enough for the delayed flush every 7th token
        let gap = if i % 7 == 6 { 50 } else { 5 };
        tokio::time::sleep(Duration::from_millis(gap)).await;

        let step = pipeline.push_token(word);
        assert!(step.connected);
        batches.extend(step.batch);
        reports.extend(step.progress);
        while let Some(batch) = pipeline.try_timed_batch() {
            batches.push(batch);
        }
    }

    let finished = pipeline.finish();
    batches.extend(finished.batches);
    batches.sort_by_key(TokenBatch::batch_number);

    let numbers: Vec<u64> = batches.iter().map(TokenBatch::batch_number).collect();
    let expected: Vec<u64> = (1..=batches.len() as u64).collect();
    assert_eq!(numbers, expected);
    assert!(batches.iter().any(|b| b.trigger() == FlushTrigger::Timeout));

    let content: String = batches.iter().map(TokenBatch::content).collect();
    assert_eq!(content, words.concat());

    // Reports are throttled and always within range
    assert!(!reports.is_empty());
    assert!(reports.len() < words.len());
    assert!(reports.iter().all(|r| (0.0..=100.0).contains(&r.percentage)));

    assert!(finished.report.complete);
    assert_eq!(finished.report.tokens_sent, 30);
    let conn = finished.connection.unwrap();
    assert_eq!(conn.partial_response(), words.concat());
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_history_carries_between_streams() {
    let registry = ConnectionRegistry::new(RegistryConfig::default()).unwrap();
    let mut config = fast_config();
    config.estimator = config.estimator.with_update_interval(Duration::ZERO);

    let mut pipeline = StreamPipeline::open(
        &registry,
        &config,
        StreamRequest::new("u1", "s1").with_history(vec![200, 200]),
    )
    .unwrap();

    let mut last = None;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        last = pipeline.push_token("t").progress;
    }
    // Seed of 40 blended toward the historical mean of 200
    let report = last.unwrap();
    assert!(report.estimated_total > 40);
    assert_ne!(report.confidence, Confidence::Low);
    pipeline.finish();

    // The finished total is seeded into the next stream on the same config
    let next = StreamPipeline::open(&registry, &config, StreamRequest::new("u1", "s2")).unwrap();
    assert_eq!(config.history.totals(None), vec![60]);
    assert_eq!(next.estimator().historical_totals(), vec![60]);
    next.abort();
}

// =============================================================================
// Test 4: Idle Sweep Against Active Streams
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweep_removes_only_silent_streams() {
    let registry = ConnectionRegistry::new(
        RegistryConfig::new()
            .with_connection_timeout(Duration::from_secs(10))
            .with_cleanup_interval(Duration::from_secs(2)),
    )
    .unwrap();
    registry.start_cleanup();

    let config = fast_config();
    let mut talking =
        StreamPipeline::open(&registry, &config, StreamRequest::new("u1", "s1")).unwrap();
    let silent = StreamPipeline::open(&registry, &config, StreamRequest::new("u2", "s2")).unwrap();

    for _ in 0..15 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(talking.heartbeat());
        talking.push_token("x");
    }

    assert!(registry.get(talking.stream_id()).is_some());
    assert!(registry.get(silent.stream_id()).is_none());
    assert!(!silent.heartbeat());

    registry.shutdown().await;
    assert!(!registry.is_cleanup_running());
}

// =============================================================================
// Test 5: Concurrent Streams Sharing One Registry
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams() {
    let registry = ConnectionRegistry::new(RegistryConfig::default()).unwrap();
    let config = fast_config();
    let mut tasks = JoinSet::new();

    for user in 0..8 {
        let registry = registry.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let mut pipeline = StreamPipeline::open(
                &registry,
                &config,
                StreamRequest::new(format!("user-{user}"), "s"),
            )
            .unwrap();

            let mut batches = Vec::new();
            for i in 0..50 {
                let step = pipeline.push_token(&format!("{i},"));
                batches.extend(step.batch);
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            while let Some(batch) = pipeline.try_timed_batch() {
                batches.push(batch);
            }
            let finished = pipeline.finish();
            batches.extend(finished.batches);
            batches.sort_by_key(TokenBatch::batch_number);

            let content: String = batches.iter().map(TokenBatch::content).collect();
            let expected: String = (0..50).map(|i| format!("{i},")).collect();
            assert_eq!(content, expected);
            finished.connection.map(|c| c.tokens_sent())
        });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap(), Some(50));
    }
    assert!(registry.is_empty());
}
