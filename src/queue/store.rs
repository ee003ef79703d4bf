//! Queue Storage Abstraction
//!
//! Object-safe file operations used by [`PersistentQueue`](super::PersistentQueue).
//!
//! ## Implementations
//!
//! - `InMemoryQueueStore`: unit tests, crash simulation, open-writer accounting
//! - `LocalQueueStore`: production (std::fs::File + sync_all)
//! - `SimulatedQueueStore`: DST with seeded fault injection

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error type for queue file operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue I/O error: {0}")]
    Io(IoError),
    #[error("queue file not found: {0}")]
    NotFound(String),
    #[error("queue disk full")]
    DiskFull,
    #[error("queue fsync failed: {0}")]
    FsyncFailed(String),
    #[error("queue partial write: expected {expected} bytes, wrote {actual}")]
    PartialWrite { expected: usize, actual: usize },
}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            _ if e.to_string().contains("No space left") => StoreError::DiskFull,
            _ => StoreError::Io(e),
        }
    }
}

/// Append-only handle on one queue file
pub trait SegmentFileWriter: Send {
    /// Append data. Returns the file size after the write.
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError>;
    /// Fsync to durable storage.
    fn sync(&mut self) -> Result<(), StoreError>;
    /// Current size of the file in bytes.
    fn size(&self) -> u64;
}

/// Storage backend for queue segments, cursors and dead letters
pub trait QueueStore: Send + Sync + 'static {
    /// Create (or truncate) a file for appending.
    fn create(&self, name: &str) -> Result<Box<dyn SegmentFileWriter>, StoreError>;
    /// Read a whole file.
    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError>;
    /// File names starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    /// Delete a file. Deleting a missing file succeeds.
    fn delete(&self, name: &str) -> Result<(), StoreError>;
    /// Atomically replace a file's contents with durable data.
    fn replace(&self, name: &str, data: &[u8]) -> Result<(), StoreError>;
    fn exists(&self, name: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// InMemoryQueueStore - For unit tests and DST
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InMemoryFile {
    data: Vec<u8>,
    /// Position up to which data is durable
    synced_pos: usize,
}

/// In-memory queue store for unit tests and deterministic simulation
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
    open_writers: Arc<AtomicUsize>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a file
    pub fn file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.data.clone())
    }

    /// Overwrite a file's bytes (durably), for corruption tests
    pub fn set_file_data(&self, name: &str, data: Vec<u8>) {
        if let Some(file) = self.files.lock().get_mut(name) {
            file.synced_pos = data.len();
            file.data = data;
        }
    }

    /// Simulate a crash: every file loses its un-synced tail.
    pub fn simulate_crash(&self) {
        for file in self.files.lock().values_mut() {
            file.data.truncate(file.synced_pos);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Writers created and not yet dropped
    pub fn open_writers(&self) -> usize {
        self.open_writers.load(Ordering::SeqCst)
    }
}

/// In-memory file writer
pub struct InMemorySegmentWriter {
    name: String,
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
    open_writers: Arc<AtomicUsize>,
    current_size: u64,
}

impl SegmentFileWriter for InMemorySegmentWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| StoreError::NotFound(self.name.clone()))?;
        file.data.extend_from_slice(data);
        self.current_size = file.data.len() as u64;
        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        if let Some(file) = self.files.lock().get_mut(&self.name) {
            file.synced_pos = file.data.len();
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

impl Drop for InMemorySegmentWriter {
    fn drop(&mut self) {
        self.open_writers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueueStore for InMemoryQueueStore {
    fn create(&self, name: &str) -> Result<Box<dyn SegmentFileWriter>, StoreError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        self.files
            .lock()
            .insert(name.to_string(), InMemoryFile::default());
        self.open_writers.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(InMemorySegmentWriter {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            open_writers: Arc::clone(&self.open_writers),
            current_size: 0,
        }))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.files
            .lock()
            .get(name)
            .map(|f| f.data.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .files
            .lock()
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn replace(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        self.files.lock().insert(
            name.to_string(),
            InMemoryFile {
                data: data.to_vec(),
                synced_pos: data.len(),
            },
        );
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.files.lock().contains_key(name))
    }
}

// ============================================================================
// LocalQueueStore - For production
// ============================================================================

/// Local filesystem queue store
#[derive(Debug, Clone)]
pub struct LocalQueueStore {
    dir: PathBuf,
}

impl LocalQueueStore {
    /// Create the store, creating the directory if it doesn't exist.
    pub fn new(dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        Ok(LocalQueueStore { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Local filesystem file writer
pub struct LocalSegmentWriter {
    file: std::fs::File,
    current_size: u64,
}

impl SegmentFileWriter for LocalSegmentWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        let written = self.file.write(data)?;
        self.current_size = self
            .current_size
            .checked_add(written as u64)
            .expect("segment size overflow is unreachable for files < u64::MAX");
        if written != data.len() {
            return Err(StoreError::PartialWrite {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        self.file
            .sync_all()
            .map_err(|e| StoreError::FsyncFailed(e.to_string()))
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

impl QueueStore for LocalQueueStore {
    fn create(&self, name: &str) -> Result<Box<dyn SegmentFileWriter>, StoreError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let file = std::fs::File::create(self.file_path(name))?;
        Ok(Box::new(LocalSegmentWriter {
            file,
            current_size: 0,
        }))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(self.file_path(name))?)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn replace(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let tmp = self.file_path(&format!("{}.tmp", name));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()
                .map_err(|e| StoreError::FsyncFailed(e.to_string()))?;
        }
        std::fs::rename(&tmp, self.file_path(name))?;
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.file_path(name).exists())
    }
}

// ============================================================================
// SimulatedQueueStore - For DST with fault injection
// ============================================================================

/// Fault probabilities for [`SimulatedQueueStore`]
#[derive(Debug, Clone)]
pub struct SimulatedQueueStoreConfig {
    pub write_fail_prob: f64,
    pub partial_write_prob: f64,
    pub fsync_fail_prob: f64,
    pub disk_full_prob: f64,
}

impl Default for SimulatedQueueStoreConfig {
    fn default() -> Self {
        SimulatedQueueStoreConfig {
            write_fail_prob: 0.01,
            partial_write_prob: 0.005,
            fsync_fail_prob: 0.005,
            disk_full_prob: 0.001,
        }
    }
}

impl SimulatedQueueStoreConfig {
    pub fn no_faults() -> Self {
        SimulatedQueueStoreConfig {
            write_fail_prob: 0.0,
            partial_write_prob: 0.0,
            fsync_fail_prob: 0.0,
            disk_full_prob: 0.0,
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedQueueStoreConfig {
            write_fail_prob: 0.05,
            partial_write_prob: 0.02,
            fsync_fail_prob: 0.02,
            disk_full_prob: 0.005,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedQueueStoreStats {
    pub write_attempts: u64,
    pub write_failures: u64,
    pub partial_writes: u64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
    pub disk_full_errors: u64,
}

struct SimulatedState {
    rng: ChaCha8Rng,
    stats: SimulatedQueueStoreStats,
}

impl SimulatedState {
    fn roll(&mut self, prob: f64) -> bool {
        prob > 0.0 && self.rng.gen::<f64>() < prob
    }
}

/// In-memory store that injects seeded write and fsync faults.
///
/// Cursor replacement is never faulted; the queue treats cursor loss as
/// replay, which the harness checks separately.
#[derive(Clone)]
pub struct SimulatedQueueStore {
    inner: InMemoryQueueStore,
    config: SimulatedQueueStoreConfig,
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedQueueStore {
    pub fn new(seed: u64, config: SimulatedQueueStoreConfig) -> Self {
        SimulatedQueueStore {
            inner: InMemoryQueueStore::new(),
            config,
            state: Arc::new(Mutex::new(SimulatedState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedQueueStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedQueueStoreStats {
        self.state.lock().stats.clone()
    }

    /// The fault-free store underneath (for crash simulation and recovery)
    pub fn inner_store(&self) -> &InMemoryQueueStore {
        &self.inner
    }
}

/// File writer with fault injection
pub struct SimulatedSegmentWriter {
    inner: Box<dyn SegmentFileWriter>,
    config: SimulatedQueueStoreConfig,
    state: Arc<Mutex<SimulatedState>>,
}

impl SegmentFileWriter for SimulatedSegmentWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.write_attempts = s.stats.write_attempts.saturating_add(1);

            if s.roll(self.config.disk_full_prob) {
                s.stats.disk_full_errors = s.stats.disk_full_errors.saturating_add(1);
                return Err(StoreError::DiskFull);
            }

            if s.roll(self.config.write_fail_prob) {
                s.stats.write_failures = s.stats.write_failures.saturating_add(1);
                return Err(StoreError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated write failure",
                )));
            }

            if data.len() > 1 && s.roll(self.config.partial_write_prob) {
                s.stats.partial_writes = s.stats.partial_writes.saturating_add(1);
                let partial_len = s.rng.gen_range(1..data.len());
                drop(s);
                // Torn write: some bytes land, caller sees an error
                let _ = self.inner.append(&data[..partial_len]);
                return Err(StoreError::PartialWrite {
                    expected: data.len(),
                    actual: partial_len,
                });
            }
        }

        self.inner.append(data)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        {
            let mut s = self.state.lock();
            s.stats.sync_attempts = s.stats.sync_attempts.saturating_add(1);

            if s.roll(self.config.fsync_fail_prob) {
                s.stats.sync_failures = s.stats.sync_failures.saturating_add(1);
                return Err(StoreError::FsyncFailed(
                    "simulated fsync failure".to_string(),
                ));
            }
        }
        self.inner.sync()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

impl QueueStore for SimulatedQueueStore {
    fn create(&self, name: &str) -> Result<Box<dyn SegmentFileWriter>, StoreError> {
        let inner = self.inner.create(name)?;
        Ok(Box::new(SimulatedSegmentWriter {
            inner,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.read(name)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name)
    }

    fn replace(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        self.inner.replace(name, data)
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        self.inner.exists(name)
    }
}
