//! Durable per-destination event queue
//!
//! Backs stream-mode destinations: every row is fsynced to a segment file
//! before ingestion is acknowledged and stays there until the stream worker
//! settles it.

pub mod config;
pub mod cursor;
pub mod dst;
pub mod log;
pub mod persistent;
pub mod store;

pub use config::QueueConfig;
pub use dst::{
    run_queue_dst_batch, summarize_queue_dst_batch, QueueDSTConfig, QueueDSTHarness,
    QueueDSTResult,
};
pub use log::{escape_name, QueueFiles};
pub use persistent::{
    DeadLetter, Delivery, NackOutcome, PersistentQueue, QueueEntry, QueueError, QueueStats,
};
pub use store::{
    InMemoryQueueStore, LocalQueueStore, QueueStore, SegmentFileWriter, SimulatedQueueStore,
    SimulatedQueueStoreConfig, SimulatedQueueStoreStats, StoreError,
};
