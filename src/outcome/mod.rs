//! Delivery outcome cache
//!
//! Bounded per-destination history of delivery outcomes, used for status
//! queries and duplicate suppression. Every attempt that failed but will be
//! retried is recorded as `retryable_error`; the final result follows.
//! Recording never blocks on I/O and never applies backpressure to delivery.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Final status of one event at one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    RetryableError,
    PermanentError,
    Skipped,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::RetryableError => "retryable_error",
            DeliveryStatus::PermanentError => "permanent_error",
            DeliveryStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub event_id: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub status: DeliveryStatus,
    pub timestamp_ms: u64,
    /// Delivery attempts made, 0 when the event never reached the adapter
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn new(
        event_id: impl Into<String>,
        destination: impl Into<String>,
        status: DeliveryStatus,
        timestamp_ms: u64,
    ) -> Self {
        DeliveryOutcome {
            event_id: event_id.into(),
            destination: destination.into(),
            table: None,
            status,
            timestamp_ms,
            attempts: 0,
            error: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Cumulative per-status counters for one destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeStats {
    pub success: u64,
    pub retryable_error: u64,
    pub permanent_error: u64,
    pub skipped: u64,
}

impl OutcomeStats {
    fn count(&mut self, status: DeliveryStatus) {
        let counter = match status {
            DeliveryStatus::Success => &mut self.success,
            DeliveryStatus::RetryableError => &mut self.retryable_error,
            DeliveryStatus::PermanentError => &mut self.permanent_error,
            DeliveryStatus::Skipped => &mut self.skipped,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.success
            .saturating_add(self.retryable_error)
            .saturating_add(self.permanent_error)
            .saturating_add(self.skipped)
    }
}

#[derive(Debug, Default)]
struct DestinationHistory {
    recent: VecDeque<DeliveryOutcome>,
    stats: OutcomeStats,
    /// Retained success outcomes per event id
    succeeded: HashMap<String, usize>,
}

impl DestinationHistory {
    fn push(&mut self, outcome: DeliveryOutcome, capacity: usize) {
        if self.recent.len() == capacity {
            if let Some(evicted) = self.recent.pop_front() {
                self.forget(&evicted);
            }
        }
        if outcome.status == DeliveryStatus::Success {
            *self.succeeded.entry(outcome.event_id.clone()).or_insert(0) += 1;
        }
        self.recent.push_back(outcome);
    }

    fn forget(&mut self, evicted: &DeliveryOutcome) {
        if evicted.status != DeliveryStatus::Success {
            return;
        }
        if let Some(count) = self.succeeded.get_mut(&evicted.event_id) {
            *count -= 1;
            if *count == 0 {
                self.succeeded.remove(&evicted.event_id);
            }
        }
    }
}

/// Shared, bounded outcome history
#[derive(Debug)]
pub struct OutcomeCache {
    capacity: usize,
    destinations: Mutex<HashMap<String, DestinationHistory>>,
}

impl OutcomeCache {
    /// `capacity` outcomes are kept per destination
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "Precondition: capacity must be positive");
        OutcomeCache {
            capacity: capacity.max(1),
            destinations: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an outcome, evicting the oldest one at capacity
    pub fn record(&self, outcome: DeliveryOutcome) {
        let mut destinations = self.destinations.lock();
        let history = destinations
            .entry(outcome.destination.clone())
            .or_default();
        history.stats.count(outcome.status);
        history.push(outcome, self.capacity);

        debug_assert!(
            history.recent.len() <= self.capacity,
            "Postcondition: history must stay within capacity"
        );
    }

    /// Up to `limit` outcomes for a destination, newest first
    pub fn recent(&self, destination: &str, limit: usize) -> Vec<DeliveryOutcome> {
        self.destinations
            .lock()
            .get(destination)
            .map(|h| h.recent.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent status of an event at a destination, if still retained
    pub fn last_status(&self, destination: &str, event_id: &str) -> Option<DeliveryStatus> {
        self.destinations.lock().get(destination).and_then(|h| {
            h.recent
                .iter()
                .rev()
                .find(|o| o.event_id == event_id)
                .map(|o| o.status)
        })
    }

    /// Whether a retained outcome shows the event delivered
    pub fn has_succeeded(&self, destination: &str, event_id: &str) -> bool {
        self.destinations
            .lock()
            .get(destination)
            .is_some_and(|h| h.succeeded.contains_key(event_id))
    }

    pub fn stats(&self, destination: &str) -> OutcomeStats {
        self.destinations
            .lock()
            .get(destination)
            .map(|h| h.stats)
            .unwrap_or_default()
    }

    /// Destinations with any recorded outcome, sorted
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.destinations.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn outcome(dest: &str, id: &str, status: DeliveryStatus) -> DeliveryOutcome {
        DeliveryOutcome::new(id, dest, status, 1_000)
    }

    #[test]
    fn test_recent_newest_first() {
        let cache = OutcomeCache::new(10);
        for i in 0..3 {
            cache.record(outcome("pg", &format!("e{}", i), DeliveryStatus::Success));
        }
        let ids: Vec<_> = cache.recent("pg", 2).into_iter().map(|o| o.event_id).collect();
        assert_eq!(ids, vec!["e2", "e1"]);
        assert!(cache.recent("missing", 5).is_empty());
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let cache = OutcomeCache::new(2);
        cache.record(outcome("pg", "a", DeliveryStatus::Success));
        cache.record(outcome("pg", "b", DeliveryStatus::Success));
        cache.record(outcome("pg", "c", DeliveryStatus::PermanentError));

        assert_eq!(cache.recent("pg", 10).len(), 2);
        assert!(!cache.has_succeeded("pg", "a"));
        assert!(cache.has_succeeded("pg", "b"));
        // Counters are cumulative
        let stats = cache.stats("pg");
        assert_eq!(stats.success, 2);
        assert_eq!(stats.permanent_error, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_success_index_follows_eviction() {
        let cache = OutcomeCache::new(3);
        cache.record(outcome("pg", "dup", DeliveryStatus::Success));
        cache.record(outcome("pg", "dup", DeliveryStatus::Success));
        cache.record(outcome("pg", "x", DeliveryStatus::RetryableError));
        assert!(cache.has_succeeded("pg", "dup"));

        // One of two retained successes evicted
        cache.record(outcome("pg", "y", DeliveryStatus::Success));
        assert!(cache.has_succeeded("pg", "dup"));

        // Last one evicted
        cache.record(outcome("pg", "z", DeliveryStatus::PermanentError));
        assert!(!cache.has_succeeded("pg", "dup"));
        assert!(!cache.has_succeeded("pg", "x"));
        assert!(cache.has_succeeded("pg", "y"));

        // Evicting a non-success keeps the index intact
        cache.record(outcome("pg", "w", DeliveryStatus::Skipped));
        assert!(cache.has_succeeded("pg", "y"));

        // Index agrees with the retained history
        for id in ["dup", "x", "y", "z", "w"] {
            let retained = cache
                .recent("pg", usize::MAX)
                .iter()
                .any(|o| o.event_id == id && o.status == DeliveryStatus::Success);
            assert_eq!(cache.has_succeeded("pg", id), retained, "event {}", id);
        }
    }

    #[test]
    fn test_per_destination_isolation() {
        let cache = OutcomeCache::new(1);
        cache.record(outcome("a", "e1", DeliveryStatus::Success));
        cache.record(outcome("b", "e1", DeliveryStatus::Skipped));

        assert_eq!(cache.last_status("a", "e1"), Some(DeliveryStatus::Success));
        assert_eq!(cache.last_status("b", "e1"), Some(DeliveryStatus::Skipped));
        assert!(!cache.has_succeeded("b", "e1"));
        assert_eq!(cache.destinations(), vec!["a", "b"]);
    }

    #[test]
    fn test_last_status_tracks_latest() {
        let cache = OutcomeCache::new(10);
        cache.record(outcome("pg", "e", DeliveryStatus::RetryableError));
        cache.record(outcome("pg", "e", DeliveryStatus::Success));
        assert_eq!(cache.last_status("pg", "e"), Some(DeliveryStatus::Success));
    }

    #[test]
    fn test_concurrent_record() {
        let cache = Arc::new(OutcomeCache::new(1_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.record(outcome("pg", &format!("{}-{}", t, i), DeliveryStatus::Success));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats("pg").success, 400);
        assert_eq!(cache.recent("pg", usize::MAX).len(), 400);
    }

    #[test]
    fn test_outcome_serializes_status_snake_case() {
        let o = outcome("pg", "e", DeliveryStatus::PermanentError).with_error("boom");
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["status"], "permanent_error");
        assert_eq!(json["error"], "boom");
        assert!(json.get("table").is_none());
    }
}
