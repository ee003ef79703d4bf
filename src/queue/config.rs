//! Durable Queue Configuration

use serde::{Deserialize, Serialize};

/// Limits for one destination queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Segment size before rotation (default: 16MB)
    pub max_segment_bytes: usize,
    /// Queue plus dead-letter segment bytes before enqueue reports
    /// backpressure (default: 1GB)
    pub max_disk_bytes: u64,
    /// Negative acknowledgements tolerated before an entry is dead-lettered
    pub max_redeliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_segment_bytes: 16 * 1024 * 1024,
            max_disk_bytes: 1024 * 1024 * 1024,
            max_redeliveries: 10,
        }
    }
}

impl QueueConfig {
    /// Configuration for testing (small segments to exercise rotation)
    pub fn test() -> Self {
        QueueConfig {
            max_segment_bytes: 4 * 1024,
            max_disk_bytes: 256 * 1024,
            max_redeliveries: 3,
        }
    }
}
