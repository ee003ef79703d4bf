//! Destination monitor locks
//!
//! Writes to a destination are serialised through a `MonitorKeeper`. The
//! keeper may be process-local or backed by a coordination service; the
//! delivery layer only sees the `DestinationLock` guard, which releases the
//! lock when dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to lock destination [{destination}]: {reason}")]
pub struct LockError {
    pub destination: String,
    pub reason: String,
}

pub type LockFuture<'a> = Pin<Box<dyn Future<Output = Result<DestinationLock, LockError>> + Send + 'a>>;

/// Lock capability for destinations
pub trait MonitorKeeper: Send + Sync + 'static {
    fn lock<'a>(&'a self, destination: &'a str) -> LockFuture<'a>;
}

/// Held while writing to a destination; released on drop
pub struct DestinationLock {
    destination: String,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl DestinationLock {
    /// A lock that guards nothing
    pub fn unguarded(destination: impl Into<String>) -> Self {
        DestinationLock {
            destination: destination.into(),
            _guard: None,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl std::fmt::Debug for DestinationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationLock")
            .field("destination", &self.destination)
            .field("guarded", &self._guard.is_some())
            .finish()
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        trace!(destination = %self.destination, "destination lock released");
    }
}

/// Keeper for single-process deployments where nothing needs locking
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitorKeeper;

impl MonitorKeeper for NoopMonitorKeeper {
    fn lock<'a>(&'a self, destination: &'a str) -> LockFuture<'a> {
        Box::pin(async move { Ok(DestinationLock::unguarded(destination)) })
    }
}

/// Keeper with one async mutex per destination
#[derive(Debug, Default)]
pub struct InProcessMonitorKeeper {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InProcessMonitorKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the destination lock is currently held
    pub fn is_locked(&self, destination: &str) -> bool {
        self.locks
            .lock()
            .get(destination)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}

impl MonitorKeeper for InProcessMonitorKeeper {
    fn lock<'a>(&'a self, destination: &'a str) -> LockFuture<'a> {
        let mutex = self
            .locks
            .lock()
            .entry(destination.to_string())
            .or_default()
            .clone();
        Box::pin(async move {
            let guard = mutex.lock_owned().await;
            trace!(destination = %destination, "destination lock acquired");
            Ok(DestinationLock {
                destination: destination.to_string(),
                _guard: Some(guard),
            })
        })
    }
}
