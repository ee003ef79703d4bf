//! Queue Deterministic Simulation Testing Harness
//!
//! Verifies durability and settlement guarantees under fault injection:
//!
//! - every successful `enqueue` survives crash + recovery
//! - acked entries are never redelivered after restart
//! - dead-lettered entries leave the queue and appear in the dead-letter log
//! - failed appends never resurface
//!
//! ## DST Methodology
//!
//! 1. Create a `SimulatedQueueStore` with seeded fault injection
//! 2. Interleave enqueue / ack / nack / dead-letter, tracking a shadow state
//! 3. Simulate a crash (un-synced bytes are lost)
//! 4. Reopen without faults and compare against the shadow state

use super::persistent::{NackOutcome, PersistentQueue, QueueEntry};
use super::store::{
    QueueStore, SimulatedQueueStore, SimulatedQueueStoreConfig, SimulatedQueueStoreStats,
};
use super::QueueConfig;
use crate::clock::Timestamp;
use crate::event::{ColumnValue, ProcessedRow};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

const DESTINATION: &str = "dst-harness";

/// Result of a single DST run
#[derive(Debug)]
pub struct QueueDSTResult {
    pub seed: u64,
    pub total_ops: usize,
    pub enqueued: usize,
    pub failed_enqueues: usize,
    pub acked: usize,
    pub dead_lettered: usize,
    pub recovered_entries: usize,
    pub missing_after_recovery: usize,
    pub unexpected_after_recovery: usize,
    pub store_stats: SimulatedQueueStoreStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the queue DST harness
#[derive(Debug, Clone)]
pub struct QueueDSTConfig {
    /// Operations per run
    pub num_ops: usize,
    pub queue_config: QueueConfig,
    pub store_config: SimulatedQueueStoreConfig,
    pub simulate_crash: bool,
    /// Probability that an operation consumes instead of enqueueing
    pub consume_prob: f64,
}

impl Default for QueueDSTConfig {
    fn default() -> Self {
        QueueDSTConfig {
            num_ops: 200,
            queue_config: QueueConfig {
                max_segment_bytes: 1024, // Small to force rotation
                max_disk_bytes: 1024 * 1024,
                max_redeliveries: 2,
            },
            store_config: SimulatedQueueStoreConfig::default(),
            simulate_crash: true,
            consume_prob: 0.4,
        }
    }
}

impl QueueDSTConfig {
    /// No faults, no crash
    pub fn baseline() -> Self {
        QueueDSTConfig {
            store_config: SimulatedQueueStoreConfig::no_faults(),
            simulate_crash: false,
            ..Default::default()
        }
    }

    /// Crash without faults
    pub fn crash_only() -> Self {
        QueueDSTConfig {
            store_config: SimulatedQueueStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Faults and crash
    pub fn chaos() -> Self {
        QueueDSTConfig {
            store_config: SimulatedQueueStoreConfig::high_chaos(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shadow {
    Live,
    Acked,
    DeadLettered,
}

/// Queue DST Harness
pub struct QueueDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: QueueDSTConfig,
}

impl QueueDSTHarness {
    pub fn new(seed: u64, config: QueueDSTConfig) -> Self {
        QueueDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    fn failure(&self, store: &SimulatedQueueStore, message: String) -> QueueDSTResult {
        QueueDSTResult {
            seed: self.seed,
            total_ops: self.config.num_ops,
            enqueued: 0,
            failed_enqueues: 0,
            acked: 0,
            dead_lettered: 0,
            recovered_entries: 0,
            missing_after_recovery: 0,
            unexpected_after_recovery: 0,
            store_stats: store.stats(),
            passed: false,
            error_message: Some(message),
        }
    }

    /// Run a single DST scenario
    pub fn run(&mut self) -> QueueDSTResult {
        let store = SimulatedQueueStore::new(self.rng.gen(), self.config.store_config.clone());
        let shared: Arc<dyn QueueStore> = Arc::new(store.clone());

        let queue = match PersistentQueue::open(DESTINATION, shared, self.config.queue_config.clone())
        {
            Ok(q) => q,
            Err(e) => return self.failure(&store, format!("Failed to open queue: {}", e)),
        };

        let mut shadow: HashMap<String, Shadow> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();

        let crash_at = if self.config.simulate_crash {
            self.rng.gen_range(1..=self.config.num_ops)
        } else {
            usize::MAX
        };

        // Phase 1: interleave producers and the consumer
        for i in 0..self.config.num_ops {
            if i == crash_at {
                store.inner_store().simulate_crash();
                break;
            }

            if self.rng.gen::<f64>() < self.config.consume_prob {
                let Some(delivery) = queue.try_dequeue() else {
                    continue;
                };
                let id = delivery.entry().row.event_id.clone();
                match self.rng.gen_range(0..10) {
                    0..=5 => {
                        if delivery.ack().is_ok() {
                            shadow.insert(id, Shadow::Acked);
                        }
                    }
                    6..=8 => {
                        if let Ok(NackOutcome::DeadLettered) = delivery.nack() {
                            shadow.insert(id, Shadow::DeadLettered);
                        }
                    }
                    _ => {
                        if delivery.dead_letter("harness rejected").is_ok() {
                            shadow.insert(id, Shadow::DeadLettered);
                        }
                    }
                }
            } else {
                let id = format!("event-{:06}", i);
                match queue.enqueue(make_entry(&id, &mut self.rng)) {
                    Ok(_) => {
                        shadow.insert(id, Shadow::Live);
                    }
                    Err(_) => {
                        failed.insert(id);
                    }
                }
            }
        }

        let already_crashed = crash_at < self.config.num_ops;
        if self.config.simulate_crash && !already_crashed {
            store.inner_store().simulate_crash();
        }
        drop(queue);

        // Phase 2: recover on the fault-free store
        let recovery_store: Arc<dyn QueueStore> = Arc::new(store.inner_store().clone());
        let recovered = match PersistentQueue::open(
            DESTINATION,
            recovery_store,
            self.config.queue_config.clone(),
        ) {
            Ok(q) => q,
            Err(e) => return self.failure(&store, format!("Recovery failed: {}", e)),
        };

        let mut recovered_ids = HashSet::new();
        while let Some(delivery) = recovered.try_dequeue() {
            recovered_ids.insert(delivery.entry().row.event_id.clone());
            // Drained entries stay settled only in this process; the store is discarded.
            let _ = delivery.ack();
        }
        let dead_ids: HashSet<String> = match recovered.dead_letters() {
            Ok(letters) => letters.into_iter().map(|d| d.entry.row.event_id).collect(),
            Err(e) => return self.failure(&store, format!("Dead-letter read failed: {}", e)),
        };

        // Phase 3: verify invariants
        let mut problems = Vec::new();
        let mut missing = 0;
        let mut unexpected = 0;

        for (id, state) in &shadow {
            match state {
                Shadow::Live if !recovered_ids.contains(id) => {
                    missing += 1;
                    if problems.len() < 10 {
                        problems.push(format!("{} lost", id));
                    }
                }
                Shadow::Acked if recovered_ids.contains(id) => {
                    unexpected += 1;
                    if problems.len() < 10 {
                        problems.push(format!("{} redelivered after ack", id));
                    }
                }
                Shadow::DeadLettered
                    if recovered_ids.contains(id) || !dead_ids.contains(id) =>
                {
                    unexpected += 1;
                    if problems.len() < 10 {
                        problems.push(format!("{} not in dead-letter log", id));
                    }
                }
                _ => {}
            }
        }
        for id in &failed {
            if recovered_ids.contains(id) {
                unexpected += 1;
                if problems.len() < 10 {
                    problems.push(format!("{} resurfaced after failed enqueue", id));
                }
            }
        }

        let passed = missing == 0 && unexpected == 0;
        let count = |s: Shadow| shadow.values().filter(|v| **v == s).count();

        QueueDSTResult {
            seed: self.seed,
            total_ops: self.config.num_ops,
            enqueued: shadow.len(),
            failed_enqueues: failed.len(),
            acked: count(Shadow::Acked),
            dead_lettered: count(Shadow::DeadLettered),
            recovered_entries: recovered_ids.len(),
            missing_after_recovery: missing,
            unexpected_after_recovery: unexpected,
            store_stats: store.stats(),
            passed,
            error_message: (!passed).then(|| {
                format!(
                    "INVARIANT VIOLATION: {} missing, {} unexpected. First problems: {:?}",
                    missing, unexpected, problems
                )
            }),
        }
    }
}

/// Run a batch of DST tests across multiple seeds
pub fn run_queue_dst_batch(
    seeds: std::ops::Range<u64>,
    config: QueueDSTConfig,
) -> Vec<QueueDSTResult> {
    seeds
        .map(|seed| QueueDSTHarness::new(seed, config.clone()).run())
        .collect()
}

/// Summarize batch results
pub fn summarize_queue_dst_batch(results: &[QueueDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let enqueued: usize = results.iter().map(|r| r.enqueued).sum();
    let failed_enqueues: usize = results.iter().map(|r| r.failed_enqueues).sum();
    let recovered: usize = results.iter().map(|r| r.recovered_entries).sum();
    let missing: usize = results.iter().map(|r| r.missing_after_recovery).sum();

    let mut summary = format!(
        "Queue DST Batch: {}/{} passed ({} failed)\n\
         Enqueued: {}, Failed enqueues: {}, Recovered: {}, Missing: {}",
        passed, total, failed, enqueued, failed_enqueues, recovered, missing
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}

fn make_entry(id: &str, rng: &mut ChaCha8Rng) -> QueueEntry {
    let mut columns = BTreeMap::new();
    columns.insert("id".to_string(), ColumnValue::Text(id.to_string()));
    columns.insert("value".to_string(), ColumnValue::Int(rng.gen_range(0..1_000)));
    let row = ProcessedRow::new(id, "events", columns, vec!["id".to_string()]);
    QueueEntry::new(DESTINATION, row, Timestamp::from_millis(rng.gen_range(0..1_000_000)))
}
