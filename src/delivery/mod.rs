//! Per-destination delivery orchestration
//!
//! A `StorageProxy` owns one destination: it runs the transform pipeline on
//! every consumed event and hands the row to either the batch worker or the
//! durable queue drained by the stream worker. Workers record every result
//! in the shared `OutcomeCache`.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──► BatchBuffer ──► BatchWorker ───┐
//! RawEvent ──► MappingStep                                  ├──► adapter ──► OutcomeCache
//!                      └──► PersistentQueue ──► StreamWorker┘
//! ```

pub mod batch;
pub mod retry;
pub mod state;
pub mod stream;

pub use retry::RetryPolicy;
pub use state::{ProxyState, StateCell};

use crate::clock::DeliveryClock;
use crate::config::{DeliveryConfig, DeliveryMode};
use crate::destination::{AdapterError, DestinationAdapter, MonitorKeeper};
use crate::event::{ProcessedRow, RawEvent};
use crate::outcome::{DeliveryOutcome, DeliveryStatus, OutcomeCache};
use crate::queue::{PersistentQueue, QueueEntry, QueueError};
use crate::transform::{MappingStep, TransformError};
use batch::{BatchBuffer, BatchCommand, BatchWorker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use stream::StreamWorker;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Flush commands waiting for the batch worker
const COMMAND_CAPACITY: usize = 16;

/// What happened to a consumed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Waiting in the batch buffer
    Buffered,
    /// Durably queued for the stream worker
    Enqueued { seq: u64 },
    /// Transform failed; recorded as skipped
    Dropped,
    /// Already delivered; recorded as skipped
    Duplicate,
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("destination [{destination}] buffer is full ({buffered}/{limit} rows)")]
    Backpressure {
        destination: String,
        buffered: usize,
        limit: usize,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("destination [{0}] is closed")]
    Closed(String),
}

impl ConsumeError {
    /// Whether the caller should slow down and try again later
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            ConsumeError::Backpressure { .. } | ConsumeError::Queue(QueueError::Backpressure { .. })
        )
    }
}

/// Result of one batch flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rows written
    pub delivered: usize,
    /// Rows dropped after a permanent error or exhausted retries
    pub failed: usize,
    /// Adapter calls made, 0 when nothing was buffered
    pub attempts: u32,
    pub error: Option<String>,
}

/// Collaborators shared by a proxy and its worker
#[derive(Clone)]
pub struct DeliveryContext {
    pub destination: String,
    pub adapter: Arc<dyn DestinationAdapter>,
    pub monitor: Arc<dyn MonitorKeeper>,
    pub outcomes: Arc<OutcomeCache>,
    pub clock: Arc<dyn DeliveryClock>,
    pub(crate) state: Arc<StateCell>,
}

impl DeliveryContext {
    pub fn new(
        destination: impl Into<String>,
        adapter: Arc<dyn DestinationAdapter>,
        monitor: Arc<dyn MonitorKeeper>,
        outcomes: Arc<OutcomeCache>,
        clock: Arc<dyn DeliveryClock>,
    ) -> Self {
        DeliveryContext {
            destination: destination.into(),
            adapter,
            monitor,
            outcomes,
            clock,
            state: Arc::new(StateCell::default()),
        }
    }

    /// Write under the destination lock
    pub(crate) async fn write(&self, rows: &[ProcessedRow]) -> Result<(), AdapterError> {
        let _lock = self
            .monitor
            .lock(&self.destination)
            .await
            .map_err(|e| AdapterError::retryable(e.to_string()))?;
        self.adapter.write(rows).await
    }

    pub(crate) fn record(
        &self,
        row: &ProcessedRow,
        status: DeliveryStatus,
        attempts: u32,
        error: Option<&str>,
    ) {
        let mut outcome = DeliveryOutcome::new(
            row.event_id.clone(),
            self.destination.clone(),
            status,
            self.clock.now().as_millis(),
        )
        .with_table(row.table.clone())
        .with_attempts(attempts);
        if let Some(error) = error {
            outcome = outcome.with_error(error);
        }
        self.outcomes.record(outcome);
    }

    fn record_skipped(&self, event_id: &str, reason: &str) {
        self.outcomes.record(
            DeliveryOutcome::new(
                event_id,
                self.destination.clone(),
                DeliveryStatus::Skipped,
                self.clock.now().as_millis(),
            )
            .with_error(reason),
        );
    }
}

/// Where rows go after the transform
pub enum ProxySink {
    Batch,
    Stream(Arc<PersistentQueue>),
}

enum Sink {
    Batch {
        buffer: Arc<BatchBuffer>,
        commands: mpsc::Sender<BatchCommand>,
    },
    Stream(Arc<PersistentQueue>),
}

/// Delivery front of one destination
pub struct StorageProxy {
    ctx: DeliveryContext,
    step: MappingStep,
    sink: Sink,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    suppress_duplicates: bool,
}

impl std::fmt::Debug for StorageProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProxy")
            .field("destination", &self.ctx.destination)
            .field("mode", &self.mode())
            .field("state", &self.state())
            .finish()
    }
}

impl StorageProxy {
    /// Create the proxy and spawn its worker. Must run inside a tokio runtime.
    pub fn start(
        ctx: DeliveryContext,
        step: MappingStep,
        sink: ProxySink,
        config: &DeliveryConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (sink, worker) = match sink {
            ProxySink::Batch => {
                let buffer = Arc::new(BatchBuffer::new(&config.batch));
                let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
                let worker = BatchWorker::new(
                    ctx.clone(),
                    buffer.clone(),
                    config.batch.clone(),
                    rx,
                    cancel.clone(),
                );
                (Sink::Batch { buffer, commands }, tokio::spawn(worker.run()))
            }
            ProxySink::Stream(queue) => {
                let worker = StreamWorker::new(
                    ctx.clone(),
                    queue.clone(),
                    config.stream.clone(),
                    cancel.clone(),
                );
                (Sink::Stream(queue), tokio::spawn(worker.run()))
            }
        };

        info!(
            destination = %ctx.destination,
            adapter = ctx.adapter.type_name(),
            "storage proxy started"
        );

        StorageProxy {
            ctx,
            step,
            sink,
            cancel,
            worker: Mutex::new(Some(worker)),
            shutdown_timeout: config.shutdown_timeout,
            suppress_duplicates: config.suppress_duplicates,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.destination
    }

    pub fn mode(&self) -> DeliveryMode {
        match self.sink {
            Sink::Batch { .. } => DeliveryMode::Batch,
            Sink::Stream(_) => DeliveryMode::Stream,
        }
    }

    pub fn state(&self) -> ProxyState {
        self.ctx.state.get()
    }

    pub fn queue(&self) -> Option<&Arc<PersistentQueue>> {
        match &self.sink {
            Sink::Stream(queue) => Some(queue),
            Sink::Batch { .. } => None,
        }
    }

    pub fn outcomes(&self) -> &Arc<OutcomeCache> {
        &self.ctx.outcomes
    }

    /// Rows waiting for delivery: buffered (batch) or queued (stream)
    pub fn backlog(&self) -> usize {
        match &self.sink {
            Sink::Batch { buffer, .. } => buffer.len(),
            Sink::Stream(queue) => queue.len(),
        }
    }

    /// Transform an event and hand it to the worker
    pub fn consume(&self, event: &RawEvent) -> Result<ConsumeOutcome, ConsumeError> {
        let destination = &self.ctx.destination;
        if self.ctx.state.is_closed() {
            return Err(ConsumeError::Closed(destination.clone()));
        }

        let event_id = event.event_id();
        if self.suppress_duplicates && self.ctx.outcomes.has_succeeded(destination, event_id) {
            debug!(destination = %destination, event_id, "duplicate event skipped");
            self.ctx.record_skipped(event_id, "duplicate of a delivered event");
            return Ok(ConsumeOutcome::Duplicate);
        }

        let row = match self.step.process(event) {
            Ok(row) => row,
            Err(e) => {
                self.ctx.record_skipped(event_id, &e.to_string());
                if self.step.break_on_error() {
                    error!(destination = %destination, event_id, error = %e, "event rejected");
                    return Err(ConsumeError::Transform(e));
                }
                warn!(destination = %destination, event_id, error = %e, "event dropped");
                return Ok(ConsumeOutcome::Dropped);
            }
        };

        match &self.sink {
            Sink::Batch { buffer, .. } => match buffer.push(row) {
                Ok(()) => Ok(ConsumeOutcome::Buffered),
                Err(buffered) => Err(ConsumeError::Backpressure {
                    destination: destination.clone(),
                    buffered,
                    limit: buffer.max_buffered_rows(),
                }),
            },
            Sink::Stream(queue) => {
                let entry = QueueEntry::new(destination.clone(), row, self.ctx.clock.now());
                let seq = queue.enqueue(entry)?;
                Ok(ConsumeOutcome::Enqueued { seq })
            }
        }
    }

    /// Flush the batch buffer now. A no-op for stream destinations.
    pub async fn flush(&self) -> Result<FlushReport, ConsumeError> {
        let Sink::Batch { commands, .. } = &self.sink else {
            return Ok(FlushReport::default());
        };
        let closed = || ConsumeError::Closed(self.ctx.destination.clone());
        if self.ctx.state.is_closed() {
            return Err(closed());
        }

        let (done, rx) = oneshot::channel();
        commands
            .send(BatchCommand::Flush { done })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Stop the worker and release the queue and adapter. Idempotent.
    pub async fn close(&self) {
        let destination = &self.ctx.destination;
        if !self.ctx.state.close() {
            return;
        }
        info!(destination = %destination, "closing destination");

        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    destination = %destination,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "worker did not stop in time, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        match &self.sink {
            Sink::Batch { buffer, .. } => {
                let abandoned = buffer.take_abandoned();
                if !abandoned.is_empty() {
                    error!(
                        destination = %destination,
                        rows = abandoned.len(),
                        "dropping undelivered rows at shutdown"
                    );
                }
                for row in &abandoned {
                    self.ctx.record(
                        row,
                        DeliveryStatus::PermanentError,
                        0,
                        Some("destination closed before delivery"),
                    );
                }
            }
            Sink::Stream(queue) => {
                if let Err(e) = queue.close() {
                    warn!(destination = %destination, error = %e, "failed to close queue");
                }
            }
        }

        if let Err(e) = self.ctx.adapter.close().await {
            warn!(destination = %destination, error = %e, "failed to close adapter");
        }
        info!(destination = %destination, "destination closed");
    }
}

impl Drop for StorageProxy {
    fn drop(&mut self) {
        // Lets the worker finish on its own when close() was never called
        self.cancel.cancel();
    }
}
