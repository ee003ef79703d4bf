//! Stream worker
//!
//! The single consumer of a destination queue. Entries are written in
//! micro-batches; each entry is acked, nacked or dead-lettered according to
//! the adapter result.

use super::state::ProxyState;
use super::DeliveryContext;
use crate::config::StreamConfig;
use crate::event::ProcessedRow;
use crate::outcome::DeliveryStatus;
use crate::queue::{Delivery, NackOutcome, PersistentQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct StreamWorker {
    ctx: DeliveryContext,
    queue: Arc<PersistentQueue>,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl StreamWorker {
    pub(crate) fn new(
        ctx: DeliveryContext,
        queue: Arc<PersistentQueue>,
        config: StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        StreamWorker {
            ctx,
            queue,
            config,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        let micro_batch_size = self.config.micro_batch_size.max(1);

        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let mut batch = Vec::with_capacity(micro_batch_size);
            batch.push(first);
            while batch.len() < micro_batch_size {
                match self.queue.try_dequeue() {
                    Some(delivery) => batch.push(delivery),
                    None => break,
                }
            }

            self.ctx.state.set(ProxyState::Consuming);
            if let Some(delay) = self.deliver(batch).await {
                self.ctx.state.set(ProxyState::Retrying);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            self.ctx.state.set(ProxyState::Idle);
        }

        info!(
            destination = %self.ctx.destination,
            pending = self.queue.len(),
            "stream worker stopped"
        );
    }

    /// Write one micro-batch. Returns the backoff to wait when it must be
    /// retried.
    async fn deliver(&self, batch: Vec<Delivery>) -> Option<Duration> {
        debug_assert!(!batch.is_empty(), "Precondition: micro-batch must not be empty");
        let rows: Vec<ProcessedRow> = batch.iter().map(|d| d.entry().row.clone()).collect();

        let error = match self.ctx.write(&rows).await {
            Ok(()) => {
                for (delivery, row) in batch.into_iter().zip(&rows) {
                    let attempts = delivery.retry_count().saturating_add(1);
                    let seq = delivery.seq();
                    let queued = self.ctx.clock.elapsed(delivery.entry().enqueued_at);
                    debug!(
                        destination = %self.ctx.destination,
                        seq,
                        queued_ms = queued.as_millis() as u64,
                        "entry delivered"
                    );
                    if let Err(e) = delivery.ack() {
                        // Written but not settled: redelivered after restart
                        warn!(destination = %self.ctx.destination, seq, error = %e, "ack failed");
                    }
                    self.ctx.record(row, DeliveryStatus::Success, attempts, None);
                }
                debug!(destination = %self.ctx.destination, rows = rows.len(), "micro-batch delivered");
                return None;
            }
            Err(e) => e,
        };

        if error.is_permanent() {
            error!(
                destination = %self.ctx.destination,
                rows = rows.len(),
                error = %error,
                "permanent write failure, dead-lettering"
            );
            for (delivery, row) in batch.into_iter().zip(&rows) {
                let attempts = delivery.retry_count().saturating_add(1);
                let seq = delivery.seq();
                if let Err(e) = delivery.dead_letter(error.message.clone()) {
                    warn!(destination = %self.ctx.destination, seq, error = %e, "dead letter failed");
                }
                self.ctx.record(row, DeliveryStatus::PermanentError, attempts, Some(&error.message));
            }
            return None;
        }

        let mut failed_attempts: u32 = 0;
        for (delivery, row) in batch.into_iter().zip(&rows) {
            let attempts = delivery.retry_count().saturating_add(1);
            let seq = delivery.seq();
            if !self.config.retry.allows_another(attempts) {
                error!(
                    destination = %self.ctx.destination,
                    seq,
                    attempts,
                    error = %error,
                    "retry limit reached, entry dead-lettered"
                );
                let detail = format!("retry limit reached: {}", error.message);
                if let Err(e) = delivery.dead_letter(detail.clone()) {
                    warn!(destination = %self.ctx.destination, seq, error = %e, "dead letter failed");
                }
                self.ctx.record(row, DeliveryStatus::PermanentError, attempts, Some(&detail));
                continue;
            }
            match delivery.nack() {
                Ok(NackOutcome::Requeued { seq: requeued }) => {
                    failed_attempts = failed_attempts.max(attempts);
                    warn!(
                        destination = %self.ctx.destination,
                        seq,
                        requeued,
                        attempt = attempts,
                        error = %error,
                        "write failed, entry requeued"
                    );
                    self.ctx.record(row, DeliveryStatus::RetryableError, attempts, Some(&error.message));
                }
                Ok(NackOutcome::DeadLettered) => {
                    error!(
                        destination = %self.ctx.destination,
                        seq,
                        attempts,
                        error = %error,
                        "redelivery limit reached, entry dead-lettered"
                    );
                    let detail = format!("redelivery limit reached: {}", error.message);
                    self.ctx.record(row, DeliveryStatus::PermanentError, attempts, Some(&detail));
                }
                Err(e) => {
                    // The entry stays pending; wait before trying it again
                    failed_attempts = failed_attempts.max(attempts);
                    warn!(destination = %self.ctx.destination, seq, error = %e, "nack failed");
                }
            }
        }
        // Nothing requeued means nothing to wait for
        (failed_attempts > 0).then(|| self.config.retry.delay_for(failed_attempts))
    }
}
