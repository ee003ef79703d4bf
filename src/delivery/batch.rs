//! Batch worker
//!
//! Rows accumulate in a bounded in-memory buffer. The worker flushes them on
//! a timer, when the buffer reaches the flush threshold, or on request, and
//! retries the whole batch with backoff.
//!
//! ```text
//! consume ──► BatchBuffer ──► BatchWorker ──► adapter.write ──► outcomes
//!                 ▲               ▲
//!   flush() ──────┴── command ────┘
//! ```

use super::state::ProxyState;
use super::{DeliveryContext, FlushReport};
use crate::config::BatchConfig;
use crate::event::ProcessedRow;
use crate::outcome::DeliveryStatus;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands for the batch worker
pub(crate) enum BatchCommand {
    /// Flush now and report the result
    Flush { done: oneshot::Sender<FlushReport> },
}

/// Rows waiting for the next flush, plus the batch being written
#[derive(Debug)]
pub(crate) struct BatchBuffer {
    rows: Mutex<Vec<ProcessedRow>>,
    in_flight: Mutex<Option<Arc<Vec<ProcessedRow>>>>,
    threshold_reached: Notify,
    flush_threshold: usize,
    max_buffered_rows: usize,
}

impl BatchBuffer {
    pub(crate) fn new(config: &BatchConfig) -> Self {
        debug_assert!(config.flush_threshold > 0, "Precondition: flush threshold must be positive");
        BatchBuffer {
            rows: Mutex::new(Vec::new()),
            in_flight: Mutex::new(None),
            threshold_reached: Notify::new(),
            flush_threshold: config.flush_threshold.max(1),
            max_buffered_rows: config.max_buffered_rows.max(1),
        }
    }

    /// Buffer a row. Fails with the current buffer length when full.
    pub(crate) fn push(&self, row: ProcessedRow) -> Result<(), usize> {
        let len = {
            let mut rows = self.rows.lock();
            if rows.len() >= self.max_buffered_rows {
                return Err(rows.len());
            }
            rows.push(row);
            rows.len()
        };
        if len >= self.flush_threshold {
            self.threshold_reached.notify_one();
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub(crate) fn max_buffered_rows(&self) -> usize {
        self.max_buffered_rows
    }

    /// Move buffered rows into the in-flight slot
    fn begin_flush(&self) -> Option<Arc<Vec<ProcessedRow>>> {
        let rows = std::mem::take(&mut *self.rows.lock());
        if rows.is_empty() {
            return None;
        }
        let batch = Arc::new(rows);
        *self.in_flight.lock() = Some(batch.clone());
        Some(batch)
    }

    fn finish_flush(&self) {
        *self.in_flight.lock() = None;
    }

    /// Rows never delivered: the in-flight batch of an aborted worker and
    /// anything still buffered.
    pub(crate) fn take_abandoned(&self) -> Vec<ProcessedRow> {
        let mut abandoned = match self.in_flight.lock().take() {
            Some(batch) => Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone()),
            None => Vec::new(),
        };
        abandoned.append(&mut self.rows.lock());
        abandoned
    }
}

pub(crate) struct BatchWorker {
    ctx: DeliveryContext,
    buffer: Arc<BatchBuffer>,
    config: BatchConfig,
    rx: mpsc::Receiver<BatchCommand>,
    cancel: CancellationToken,
}

impl BatchWorker {
    pub(crate) fn new(
        ctx: DeliveryContext,
        buffer: Arc<BatchBuffer>,
        config: BatchConfig,
        rx: mpsc::Receiver<BatchCommand>,
        cancel: CancellationToken,
    ) -> Self {
        BatchWorker {
            ctx,
            buffer,
            config,
            rx,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(BatchCommand::Flush { done }) => {
                        let report = self.flush().await;
                        let _ = done.send(report);
                    }
                    None => break,
                },
                _ = self.buffer.threshold_reached.notified() => {
                    self.flush().await;
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        let report = self.flush().await;
        info!(
            destination = %self.ctx.destination,
            delivered = report.delivered,
            failed = report.failed,
            "batch worker stopped after final flush"
        );
    }

    /// Write everything buffered as one batch
    async fn flush(&self) -> FlushReport {
        let Some(rows) = self.buffer.begin_flush() else {
            return FlushReport::default();
        };
        self.ctx.state.set(ProxyState::Flushing);
        let retry = &self.config.retry;

        let mut attempts: u32 = 0;
        let result = loop {
            attempts = attempts
                .checked_add(1)
                .expect("flush attempts overflow unreachable");
            match self.ctx.write(&rows[..]).await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_permanent() || !retry.allows_another(attempts) => break Err(e),
                Err(e) => {
                    let delay = retry.delay_for(attempts);
                    warn!(
                        destination = %self.ctx.destination,
                        rows = rows.len(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "batch write failed, retrying"
                    );
                    for row in rows.iter() {
                        self.ctx.record(row, DeliveryStatus::RetryableError, attempts, Some(&e.message));
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let report = match result {
            Ok(()) => {
                for row in rows.iter() {
                    self.ctx.record(row, DeliveryStatus::Success, attempts, None);
                }
                debug!(
                    destination = %self.ctx.destination,
                    rows = rows.len(),
                    attempts,
                    "batch delivered"
                );
                FlushReport {
                    delivered: rows.len(),
                    failed: 0,
                    attempts,
                    error: None,
                }
            }
            Err(e) => {
                error!(
                    destination = %self.ctx.destination,
                    rows = rows.len(),
                    attempts,
                    error = %e,
                    "dropping batch"
                );
                for row in rows.iter() {
                    self.ctx.record(row, DeliveryStatus::PermanentError, attempts, Some(&e.message));
                }
                FlushReport {
                    delivered: 0,
                    failed: rows.len(),
                    attempts,
                    error: Some(e.to_string()),
                }
            }
        };

        self.buffer.finish_flush();
        self.ctx.state.set(ProxyState::Idle);
        report
    }
}
