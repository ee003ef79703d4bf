//! Adapter that writes rows to the tracing log. Useful for dry runs.

use super::adapter::{AdapterContext, AdapterFuture, DestinationAdapter};
use crate::event::ProcessedRow;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub const LOG_TYPE: &str = "log";

#[derive(Debug)]
pub struct LogAdapter {
    destination: String,
    rows_written: AtomicU64,
}

impl LogAdapter {
    pub fn new(destination: impl Into<String>) -> Self {
        LogAdapter {
            destination: destination.into(),
            rows_written: AtomicU64::new(0),
        }
    }

    pub fn from_context(ctx: &AdapterContext) -> Self {
        LogAdapter::new(ctx.name.clone())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }
}

impl DestinationAdapter for LogAdapter {
    fn type_name(&self) -> &str {
        LOG_TYPE
    }

    fn write<'a>(&'a self, rows: &'a [ProcessedRow]) -> AdapterFuture<'a> {
        Box::pin(async move {
            for row in rows {
                info!(
                    destination = %self.destination,
                    table = %row.table,
                    event_id = %row.event_id,
                    row = %row.to_json(),
                    "row"
                );
            }
            self.rows_written.fetch_add(rows.len() as u64, Ordering::Relaxed);
            Ok(())
        })
    }
}
