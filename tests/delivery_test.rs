//! Delivery Scenario Tests
//!
//! End-to-end scenarios through the registry: configuration, transform,
//! batch and stream delivery, retries, outcomes and restart replay. Adapters
//! are scripted so every failure is deterministic.

use event_relay::clock::{SimulatedClock, Timestamp};
use event_relay::config::{DataLayout, DeliveryConfig, DestinationConfig};
use event_relay::delivery::{ConsumeError, ConsumeOutcome, ProxyState};
use event_relay::destination::{
    AdapterError, AdapterFuture, DestinationAdapter, DestinationRegistry, FileAdapter,
    InProcessMonitorKeeper, SetupError,
};
use event_relay::event::{ProcessedRow, RawEvent};
use event_relay::outcome::{DeliveryStatus, OutcomeCache};
use event_relay::queue::{InMemoryQueueStore, LocalQueueStore};
use event_relay::CreateDeps;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

/// Adapter that plays back scripted results, then succeeds
#[derive(Default)]
struct ScriptedAdapter {
    script: Mutex<VecDeque<Result<(), AdapterError>>>,
    fallback: Option<AdapterError>,
    hang: bool,
    written: Mutex<Vec<ProcessedRow>>,
    received: Mutex<Vec<ProcessedRow>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn scripted(results: Vec<Result<(), AdapterError>>) -> Arc<Self> {
        Arc::new(ScriptedAdapter {
            script: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    fn always_failing(error: AdapterError) -> Arc<Self> {
        Arc::new(ScriptedAdapter {
            fallback: Some(error),
            ..Self::default()
        })
    }

    /// Records what it receives and never completes
    fn hanging() -> Arc<Self> {
        Arc::new(ScriptedAdapter {
            hang: true,
            ..Self::default()
        })
    }

    fn written_ids(&self) -> Vec<String> {
        self.written.lock().iter().map(|r| r.event_id.clone()).collect()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DestinationAdapter for ScriptedAdapter {
    fn type_name(&self) -> &str {
        "postgres"
    }

    fn write<'a>(&'a self, rows: &'a [ProcessedRow]) -> AdapterFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.received.lock().extend_from_slice(rows);
            if self.hang {
                std::future::pending::<()>().await;
            }
            let result = match self.script.lock().pop_front() {
                Some(result) => result,
                None => match &self.fallback {
                    Some(error) => Err(error.clone()),
                    None => Ok(()),
                },
            };
            if result.is_ok() {
                self.written.lock().extend_from_slice(rows);
            }
            result
        })
    }
}

fn registry_with(adapter: Arc<ScriptedAdapter>) -> DestinationRegistry {
    let mut registry = DestinationRegistry::with_builtin();
    registry.register("postgres", move |_ctx| {
        let adapter: Arc<dyn DestinationAdapter> = adapter.clone();
        Ok(adapter)
    });
    registry
}

fn postgres(mode: &str) -> DestinationConfig {
    DestinationConfig {
        destination_type: Some("postgres".to_string()),
        mode: Some(mode.to_string()),
        ..DestinationConfig::default()
    }
}

fn event(id: &str, extra: Value) -> RawEvent {
    let mut value = json!({"eventn_ctx_event_id": id, "event_type": "click"});
    if let (Some(object), Value::Object(extra)) = (value.as_object_mut(), extra) {
        object.extend(extra);
    }
    RawEvent::from_value("js-token", value).unwrap()
}

/// Batch config that only flushes on request
fn manual_flush_config() -> DeliveryConfig {
    let mut config = DeliveryConfig::test();
    config.batch.flush_interval = Duration::from_secs(3600);
    config.batch.flush_threshold = 10_000;
    config.batch.max_buffered_rows = 10_000;
    config
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn last_status(outcomes: &OutcomeCache, destination: &str, id: &str) -> Option<DeliveryStatus> {
    outcomes.last_status(destination, id)
}

// =============================================================================
// Stream Mode
// =============================================================================

#[tokio::test]
async fn test_stream_transient_failure_then_success() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::scripted(vec![Err(AdapterError::retryable("connection reset"))]);
    let registry = registry_with(adapter.clone());
    let deps = CreateDeps::new(store, DeliveryConfig::test());

    let (proxy, queue) = registry.create("pg", &postgres("stream"), &deps).unwrap();
    assert!(queue.is_some());

    let outcome = proxy.consume(&event("evt-1", json!({}))).unwrap();
    assert!(matches!(outcome, ConsumeOutcome::Enqueued { .. }));

    let outcomes = deps.outcomes.clone();
    wait_until("success outcome", || {
        last_status(&outcomes, "pg", "evt-1") == Some(DeliveryStatus::Success)
    })
    .await;

    let stats = outcomes.stats("pg");
    assert_eq!(stats.success, 1);
    assert_eq!(stats.retryable_error, 1);
    assert_eq!(adapter.calls(), 2);

    let latest = &outcomes.recent("pg", 1)[0];
    assert_eq!(latest.attempts, 2);
    assert_eq!(latest.table.as_deref(), Some("events"));
    assert_eq!(adapter.written_ids(), vec!["evt-1"]);

    proxy.close().await;
    assert_eq!(proxy.state(), ProxyState::Closed);
}

#[tokio::test]
async fn test_stream_permanent_failure_dead_letters() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::always_failing(AdapterError::permanent("column type mismatch"));
    let registry = registry_with(adapter.clone());
    let deps = CreateDeps::new(store, DeliveryConfig::test());

    let (proxy, queue) = registry.create("pg", &postgres("stream"), &deps).unwrap();
    let queue = queue.unwrap();
    proxy.consume(&event("evt-1", json!({}))).unwrap();

    let outcomes = deps.outcomes.clone();
    wait_until("permanent error", || {
        last_status(&outcomes, "pg", "evt-1") == Some(DeliveryStatus::PermanentError)
    })
    .await;

    assert_eq!(adapter.calls(), 1);
    let dead = queue.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].entry.row.event_id, "evt-1");
    assert_eq!(dead[0].reason, "column type mismatch");
    proxy.close().await;
}

#[tokio::test]
async fn test_stream_retry_attempts_cap_deliveries() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::always_failing(AdapterError::unclassified("timeout"));
    let mut config = DeliveryConfig::test();
    config.stream.retry.max_attempts = 2;
    config.queue.max_redeliveries = 10;
    let deps = CreateDeps::new(store, config);

    let (proxy, queue) = registry_with(adapter.clone())
        .create("pg", &postgres("stream"), &deps)
        .unwrap();
    proxy.consume(&event("evt-1", json!({}))).unwrap();

    let outcomes = deps.outcomes.clone();
    wait_until("dead letter", || {
        last_status(&outcomes, "pg", "evt-1") == Some(DeliveryStatus::PermanentError)
    })
    .await;

    assert_eq!(adapter.calls(), 2);
    assert_eq!(outcomes.stats("pg").retryable_error, 1);
    let latest = &outcomes.recent("pg", 1)[0];
    assert_eq!(latest.attempts, 2);
    assert!(latest.error.as_deref().unwrap().contains("retry limit reached"));

    let dead = queue.unwrap().dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("retry limit reached"));
    proxy.close().await;
}

#[tokio::test]
async fn test_stream_redelivery_limit_dead_letters() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::always_failing(AdapterError::unclassified("timeout"));
    let mut config = DeliveryConfig::test();
    config.stream.retry.max_attempts = 100;
    let max_redeliveries = config.queue.max_redeliveries;
    let deps = CreateDeps::new(store, config);

    let (proxy, queue) = registry_with(adapter.clone())
        .create("pg", &postgres("stream"), &deps)
        .unwrap();
    proxy.consume(&event("evt-1", json!({}))).unwrap();

    let outcomes = deps.outcomes.clone();
    wait_until("dead letter", || {
        last_status(&outcomes, "pg", "evt-1") == Some(DeliveryStatus::PermanentError)
    })
    .await;

    let attempts = max_redeliveries as usize + 1;
    assert_eq!(adapter.calls(), attempts);
    assert_eq!(outcomes.stats("pg").retryable_error, max_redeliveries as u64);
    let latest = &outcomes.recent("pg", 1)[0];
    assert!(latest.error.as_deref().unwrap().contains("redelivery limit"));
    assert_eq!(queue.unwrap().dead_letters().unwrap().len(), 1);
    proxy.close().await;
}

#[tokio::test]
async fn test_timestamps_come_from_the_configured_clock() {
    let store = Arc::new(InMemoryQueueStore::new());
    let clock = SimulatedClock::new(1_000);
    let adapter = ScriptedAdapter::always_failing(AdapterError::permanent("rejected"));
    let deps =
        CreateDeps::new(store, manual_flush_config()).with_clock(Arc::new(clock.clone()));
    let registry = registry_with(adapter);

    let (stream, queue) = registry.create("pg", &postgres("stream"), &deps).unwrap();
    stream.consume(&event("evt-1", json!({}))).unwrap();
    let outcomes = deps.outcomes.clone();
    wait_until("dead letter", || {
        last_status(&outcomes, "pg", "evt-1") == Some(DeliveryStatus::PermanentError)
    })
    .await;
    let dead = queue.unwrap().dead_letters().unwrap();
    assert_eq!(dead[0].entry.enqueued_at, Timestamp::from_millis(1_000));
    assert_eq!(outcomes.recent("pg", 1)[0].timestamp_ms, 1_000);
    stream.close().await;

    let (batch, _) = registry.create("archive", &postgres("batch"), &deps).unwrap();
    batch.consume(&event("evt-2", json!({}))).unwrap();
    clock.advance_ms(1_500);
    batch.flush().await.unwrap();
    assert_eq!(outcomes.recent("archive", 1)[0].timestamp_ms, 2_500);
    batch.close().await;
}

#[tokio::test]
async fn test_stream_restart_replays_unacknowledged_entry() {
    let store = Arc::new(InMemoryQueueStore::new());
    let mut config = DeliveryConfig::test();
    config.shutdown_timeout = Duration::from_millis(100);

    let hanging = ScriptedAdapter::hanging();
    let deps = CreateDeps::new(store.clone(), config.clone());
    let (proxy, _) = registry_with(hanging.clone())
        .create("pg", &postgres("stream"), &deps)
        .unwrap();
    proxy
        .consume(&event("evt-1", json!({"nested": {"price": 9.5, "tags": ["a"]}})))
        .unwrap();
    wait_until("write attempt", || hanging.calls() == 1).await;
    proxy.close().await;
    assert!(hanging.written_ids().is_empty());
    assert_eq!(store.open_writers(), 0);

    // Process restart: everything in memory is gone except the store
    store.simulate_crash();
    let working = ScriptedAdapter::succeeding();
    let deps = CreateDeps::new(store.clone(), config);
    let (proxy, _) = registry_with(working.clone())
        .create("pg", &postgres("stream"), &deps)
        .unwrap();

    let outcomes = deps.outcomes.clone();
    wait_until("replayed delivery", || {
        last_status(&outcomes, "pg", "evt-1") == Some(DeliveryStatus::Success)
    })
    .await;

    let before = hanging.received.lock()[0].clone();
    let after = working.written.lock()[0].clone();
    assert_eq!(before, after);
    assert_eq!(
        bincode::serialize(&before).unwrap(),
        bincode::serialize(&after).unwrap()
    );
    proxy.close().await;
}

#[tokio::test]
async fn test_stream_queue_on_local_disk() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(LocalQueueStore::new(temp.path().to_path_buf()).unwrap());
    let adapter = ScriptedAdapter::succeeding();
    let deps = CreateDeps::new(store, DeliveryConfig::test());

    let (proxy, _) = registry_with(adapter.clone())
        .create("pg", &postgres("stream"), &deps)
        .unwrap();
    for i in 0..20 {
        proxy.consume(&event(&format!("evt-{}", i), json!({}))).unwrap();
    }

    wait_until("all delivered", || adapter.written_ids().len() == 20).await;
    let expected: Vec<String> = (0..20).map(|i| format!("evt-{}", i)).collect();
    assert_eq!(adapter.written_ids(), expected);
    proxy.close().await;
}

// =============================================================================
// Batch Mode
// =============================================================================

#[tokio::test]
async fn test_batch_flush_records_one_success_per_row() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::succeeding();
    let keeper = Arc::new(InProcessMonitorKeeper::new());
    let deps = CreateDeps::new(store.clone(), manual_flush_config()).with_monitor(keeper.clone());

    let (proxy, queue) = registry_with(adapter.clone())
        .create("pg", &postgres("batch"), &deps)
        .unwrap();
    assert!(queue.is_none());
    assert_eq!(store.file_count(), 0);

    for i in 0..5 {
        let outcome = proxy.consume(&event(&format!("evt-{}", i), json!({}))).unwrap();
        assert_eq!(outcome, ConsumeOutcome::Buffered);
    }
    assert_eq!(proxy.backlog(), 5);

    let report = proxy.flush().await.unwrap();
    assert_eq!(report.delivered, 5);
    assert_eq!(report.attempts, 1);
    assert!(!keeper.is_locked("pg"));

    let outcomes = &deps.outcomes;
    assert_eq!(outcomes.stats("pg").success, 5);
    assert_eq!(outcomes.stats("pg").total(), 5);
    for i in 0..5 {
        assert_eq!(
            last_status(outcomes, "pg", &format!("evt-{}", i)),
            Some(DeliveryStatus::Success)
        );
    }

    let empty = proxy.flush().await.unwrap();
    assert_eq!(empty.delivered, 0);
    assert_eq!(empty.attempts, 0);
    proxy.close().await;
}

#[tokio::test]
async fn test_batch_threshold_triggers_flush() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::succeeding();
    let mut config = manual_flush_config();
    config.batch.flush_threshold = 3;
    let deps = CreateDeps::new(store, config);

    let (proxy, _) = registry_with(adapter.clone())
        .create("pg", &postgres("batch"), &deps)
        .unwrap();
    for i in 0..3 {
        proxy.consume(&event(&format!("evt-{}", i), json!({}))).unwrap();
    }
    wait_until("threshold flush", || adapter.written_ids().len() == 3).await;
    proxy.close().await;
}

#[tokio::test]
async fn test_batch_retries_then_drops() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::always_failing(AdapterError::retryable("warehouse unavailable"));
    let config = manual_flush_config();
    let max_attempts = config.batch.retry.max_attempts;
    let deps = CreateDeps::new(store, config);

    let (proxy, _) = registry_with(adapter.clone())
        .create("pg", &postgres("batch"), &deps)
        .unwrap();
    proxy.consume(&event("evt-1", json!({}))).unwrap();
    proxy.consume(&event("evt-2", json!({}))).unwrap();

    let report = proxy.flush().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.attempts, max_attempts);
    assert!(report.error.unwrap().contains("warehouse unavailable"));
    assert_eq!(adapter.calls(), max_attempts as usize);

    let stats = deps.outcomes.stats("pg");
    assert_eq!(stats.permanent_error, 2);
    assert_eq!(stats.retryable_error, 2 * (max_attempts as u64 - 1));
    proxy.close().await;
}

#[tokio::test]
async fn test_batch_permanent_error_stops_retrying() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::scripted(vec![Err(AdapterError::permanent("bad schema"))]);
    let deps = CreateDeps::new(store, manual_flush_config());

    let (proxy, _) = registry_with(adapter.clone())
        .create("pg", &postgres("batch"), &deps)
        .unwrap();
    proxy.consume(&event("evt-1", json!({}))).unwrap();

    let report = proxy.flush().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.attempts, 1);
    assert_eq!(
        last_status(&deps.outcomes, "pg", "evt-1"),
        Some(DeliveryStatus::PermanentError)
    );
    proxy.close().await;
}

#[tokio::test]
async fn test_batch_backpressure_rejects_without_dropping() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::succeeding();
    let mut config = manual_flush_config();
    config.batch.max_buffered_rows = 3;
    let deps = CreateDeps::new(store, config);

    let (proxy, _) = registry_with(adapter.clone())
        .create("pg", &postgres("batch"), &deps)
        .unwrap();
    for i in 0..3 {
        proxy.consume(&event(&format!("evt-{}", i), json!({}))).unwrap();
    }

    let err = proxy.consume(&event("evt-3", json!({}))).unwrap_err();
    assert!(err.is_backpressure());
    assert!(matches!(err, ConsumeError::Backpressure { buffered: 3, limit: 3, .. }));

    proxy.flush().await.unwrap();
    assert_eq!(adapter.written_ids(), vec!["evt-0", "evt-1", "evt-2"]);
    assert_eq!(last_status(&deps.outcomes, "pg", "evt-3"), None);

    // Space is available again after the flush
    assert_eq!(
        proxy.consume(&event("evt-3", json!({}))).unwrap(),
        ConsumeOutcome::Buffered
    );
    proxy.close().await;
}

#[tokio::test]
async fn test_stream_backpressure_when_queue_is_full() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::hanging();
    let mut config = DeliveryConfig::test();
    config.queue.max_segment_bytes = 512;
    config.queue.max_disk_bytes = 2048;
    config.shutdown_timeout = Duration::from_millis(100);
    let deps = CreateDeps::new(store, config);

    let (proxy, queue) = registry_with(adapter)
        .create("pg", &postgres("stream"), &deps)
        .unwrap();
    let queue = queue.unwrap();

    let mut accepted = 0;
    let err = loop {
        match proxy.consume(&event(&format!("evt-{}", accepted), json!({"pad": "x".repeat(64)}))) {
            Ok(_) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted < 1000, "queue never reported backpressure");
    };
    assert!(err.is_backpressure(), "{}", err);
    assert!(accepted > 0);
    assert_eq!(queue.len(), accepted);
    proxy.close().await;
}

#[tokio::test]
async fn test_close_records_rows_that_never_reached_the_destination() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::hanging();
    let mut config = manual_flush_config();
    config.shutdown_timeout = Duration::from_millis(100);
    let deps = CreateDeps::new(store, config);

    let (proxy, _) = registry_with(adapter)
        .create("pg", &postgres("batch"), &deps)
        .unwrap();
    proxy.consume(&event("evt-1", json!({}))).unwrap();
    proxy.close().await;

    assert_eq!(
        last_status(&deps.outcomes, "pg", "evt-1"),
        Some(DeliveryStatus::PermanentError)
    );
    assert!(matches!(
        proxy.consume(&event("evt-2", json!({}))),
        Err(ConsumeError::Closed(_))
    ));
    assert!(proxy.flush().await.is_err());
}

// =============================================================================
// Transform and Construction
// =============================================================================

#[tokio::test]
async fn test_break_on_error_rejects_only_the_failing_event() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::succeeding();
    let deps = CreateDeps::new(store, manual_flush_config());
    let config = DestinationConfig {
        break_on_error: true,
        ..postgres("batch")
    };

    let (proxy, _) = registry_with(adapter.clone()).create("pg", &config, &deps).unwrap();

    let err = proxy
        .consume(&event("bad", json!({"source_ip": "not-an-ip"})))
        .unwrap_err();
    assert!(matches!(err, ConsumeError::Transform(_)));

    let ok = proxy.consume(&event("good", json!({"source_ip": "10.0.0.1"}))).unwrap();
    assert_eq!(ok, ConsumeOutcome::Buffered);

    proxy.flush().await.unwrap();
    assert_eq!(adapter.written_ids(), vec!["good"]);
    assert_eq!(last_status(&deps.outcomes, "pg", "bad"), Some(DeliveryStatus::Skipped));
    proxy.close().await;
}

#[tokio::test]
async fn test_transform_error_without_break_drops_event() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::succeeding();
    let deps = CreateDeps::new(store, manual_flush_config());
    let config = DestinationConfig {
        data_layout: Some(DataLayout {
            table_name_template: Some("{{.missing}}".to_string()),
            ..DataLayout::default()
        }),
        ..postgres("batch")
    };

    let (proxy, _) = registry_with(adapter.clone()).create("pg", &config, &deps).unwrap();
    assert_eq!(
        proxy.consume(&event("evt-1", json!({}))).unwrap(),
        ConsumeOutcome::Dropped
    );
    let skipped = &deps.outcomes.recent("pg", 1)[0];
    assert_eq!(skipped.status, DeliveryStatus::Skipped);
    assert!(skipped.error.as_deref().unwrap().contains("empty name"));
    proxy.close().await;
}

#[tokio::test]
async fn test_duplicate_event_is_skipped() {
    let store = Arc::new(InMemoryQueueStore::new());
    let adapter = ScriptedAdapter::succeeding();
    let deps = CreateDeps::new(store, manual_flush_config());

    let (proxy, _) = registry_with(adapter.clone())
        .create("pg", &postgres("batch"), &deps)
        .unwrap();
    proxy.consume(&event("evt-1", json!({}))).unwrap();
    proxy.flush().await.unwrap();

    assert_eq!(
        proxy.consume(&event("evt-1", json!({}))).unwrap(),
        ConsumeOutcome::Duplicate
    );
    proxy.flush().await.unwrap();
    assert_eq!(adapter.written_ids(), vec!["evt-1"]);
    assert_eq!(deps.outcomes.stats("pg").skipped, 1);
    proxy.close().await;
}

#[tokio::test]
async fn test_invalid_mode_error_names_both_modes() {
    let store = Arc::new(InMemoryQueueStore::new());
    let deps = CreateDeps::new(store, DeliveryConfig::test());
    let err = registry_with(ScriptedAdapter::succeeding())
        .create("pg", &postgres("invalid"), &deps)
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("batch"), "{}", message);
    assert!(message.contains("stream"), "{}", message);
}

#[tokio::test]
async fn test_unknown_type_leaves_no_open_queue_files() {
    let store = Arc::new(InMemoryQueueStore::new());
    let deps = CreateDeps::new(store.clone(), DeliveryConfig::test());
    let config = DestinationConfig {
        destination_type: Some("snowflake".to_string()),
        mode: Some("stream".to_string()),
        ..DestinationConfig::default()
    };

    let err = DestinationRegistry::with_builtin()
        .create("warehouse", &config, &deps)
        .unwrap_err();
    assert!(matches!(err, SetupError::UnknownType { .. }));
    assert_eq!(store.open_writers(), 0);
}

#[tokio::test]
async fn test_file_destination_end_to_end() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryQueueStore::new());
    let deps = CreateDeps::new(store, manual_flush_config());
    let mut config = DestinationConfig {
        destination_type: Some("file".to_string()),
        data_layout: Some(DataLayout {
            table_name_template: Some("{{.event_type}}".to_string()),
            mapping: vec!["/user/id -> /user_id".to_string()],
            ..DataLayout::default()
        }),
        ..DestinationConfig::default()
    };
    config
        .connection
        .insert("file".to_string(), json!({"path": temp.path().to_str().unwrap()}));

    let (proxy, _) = DestinationRegistry::with_builtin()
        .create("archive", &config, &deps)
        .unwrap();
    proxy
        .consume(&event("evt-1", json!({"user": {"id": "u1"}})))
        .unwrap();
    proxy.close().await;

    let rows = FileAdapter::new(temp.path().to_path_buf())
        .unwrap()
        .read_table("click")
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["user_id"], "u1");
    assert_eq!(rows[0]["eventn_ctx_event_id"], "evt-1");
}
