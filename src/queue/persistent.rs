//! Persistent per-destination FIFO queue
//!
//! Entries are appended to segment files and fsynced before `enqueue`
//! returns. A single consumer takes [`Delivery`] handles with `dequeue` and
//! settles each one with `ack`, `nack` or `dead_letter`. Settled sequence
//! numbers go into the cursor; segments whose entries are all settled are
//! deleted.

use super::cursor::Cursor;
use super::log::{read_segment, QueueFiles, QueueRecord, SegmentWriter, RECORD_OVERHEAD};
use super::store::{QueueStore, StoreError};
use super::QueueConfig;
use crate::clock::Timestamp;
use crate::event::ProcessedRow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// One queued row for one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub destination: String,
    pub enqueued_at: Timestamp,
    /// Negative acknowledgements so far
    pub retry_count: u32,
    pub row: ProcessedRow,
}

impl QueueEntry {
    pub fn new(destination: impl Into<String>, row: ProcessedRow, enqueued_at: Timestamp) -> Self {
        QueueEntry {
            destination: destination.into(),
            enqueued_at,
            retry_count: 0,
            row,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("queue {destination} is over its disk limit ({usage} + {record} > {limit} bytes)")]
    Backpressure {
        destination: String,
        usage: u64,
        record: u64,
        limit: u64,
    },

    #[error("queue {0} is closed")]
    Closed(String),

    #[error("queue entry encoding failed: {0}")]
    Encode(String),
}

/// Result of a negative acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Re-appended at the tail under a new sequence number
    Requeued { seq: u64 },
    /// Redelivery budget exhausted; moved to the dead-letter log
    DeadLettered,
}

/// An entry moved to the dead-letter log
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub seq: u64,
    pub entry: QueueEntry,
    pub reason: String,
}

#[derive(Serialize, Deserialize)]
struct DeadLetterRecord {
    entry: QueueEntry,
    reason: String,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub segments: usize,
    pub disk_bytes: u64,
    pub dead_letter_bytes: u64,
    pub committed: u64,
    pub next_seq: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SegmentInfo {
    bytes: u64,
    /// Unsettled entries stored in this segment
    live: usize,
}

struct QueueState {
    cursor: Cursor,
    next_seq: u64,
    next_segment: u64,
    next_dead_segment: u64,
    active: Option<SegmentWriter>,
    dead: Option<SegmentWriter>,
    segments: BTreeMap<u64, SegmentInfo>,
    /// Bytes held by dead-letter segments
    dead_bytes: u64,
    seq_segment: HashMap<u64, u64>,
    pending: VecDeque<(u64, QueueEntry)>,
    in_flight: usize,
    closed: bool,
}

impl QueueState {
    /// Queue and dead-letter segment bytes; both count toward `max_disk_bytes`
    fn disk_usage(&self) -> u64 {
        self.segments
            .values()
            .map(|s| s.bytes)
            .sum::<u64>()
            .saturating_add(self.dead_bytes)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = seq
            .checked_add(1)
            .expect("sequence overflow is unreachable");
        seq
    }

    fn settle(&mut self, seq: u64) {
        self.cursor.settle(seq);
        if let Some(segment) = self.seq_segment.remove(&seq) {
            if let Some(info) = self.segments.get_mut(&segment) {
                debug_assert!(info.live > 0, "Invariant: live count must cover settled seq");
                info.live = info.live.saturating_sub(1);
            }
        }
    }
}

struct QueueInner {
    name: String,
    files: QueueFiles,
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

enum Next {
    Ready(Delivery),
    Empty,
    Closed,
}

/// Durable FIFO queue for one stream destination
pub struct PersistentQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl PersistentQueue {
    /// Open (or create) the queue for `name`, replaying its segments.
    pub fn open(
        name: &str,
        store: Arc<dyn QueueStore>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        debug_assert!(!name.is_empty(), "Precondition: queue name must not be empty");

        let files = QueueFiles::new(name);
        let state = recover(name, &files, store.as_ref())?;

        info!(
            destination = %name,
            pending = state.pending.len(),
            segments = state.segments.len(),
            committed = state.cursor.committed(),
            next_seq = state.next_seq,
            "opened durable queue"
        );

        let inner = QueueInner {
            name: name.to_string(),
            files,
            store,
            config,
            state: Mutex::new(state),
            notify: Notify::new(),
        };
        {
            let mut state = inner.state.lock();
            inner.persist_cursor(&state)?;
            inner.truncate(&mut state);
        }

        Ok(PersistentQueue {
            inner: Arc::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append an entry durably. Returns its sequence number.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<u64, QueueError> {
        debug_assert_eq!(
            entry.destination, self.inner.name,
            "Precondition: entry must belong to this queue"
        );

        let payload = encode_payload(&entry)?;
        let record_size = RECORD_OVERHEAD.saturating_add(payload.len()) as u64;

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(QueueError::Closed(self.inner.name.clone()));
        }
        self.inner.ensure_capacity(&mut state, record_size)?;

        let seq = state.take_seq();
        match self.inner.append_durable(&mut state, seq, payload) {
            Ok(segment) => {
                state.seq_segment.insert(seq, segment);
                if let Some(info) = state.segments.get_mut(&segment) {
                    info.live = info.live.saturating_add(1);
                }
                state.pending.push_back((seq, entry));
                drop(state);
                self.inner.notify.notify_one();
                Ok(seq)
            }
            Err(e) => {
                self.inner.abandon_hole(&mut state, seq, &e);
                Err(e.into())
            }
        }
    }

    /// Wait for the next entry. Returns None once the queue is closed.
    pub async fn dequeue(&self) -> Option<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next() {
                Next::Ready(delivery) => return Some(delivery),
                Next::Closed => return None,
                Next::Empty => notified.await,
            }
        }
    }

    /// Take the next entry without waiting
    pub fn try_dequeue(&self) -> Option<Delivery> {
        match self.next() {
            Next::Ready(delivery) => Some(delivery),
            Next::Empty | Next::Closed => None,
        }
    }

    fn next(&self) -> Next {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Next::Closed;
        }
        match state.pending.pop_front() {
            Some((seq, entry)) => {
                state.in_flight = state.in_flight.saturating_add(1);
                Next::Ready(Delivery {
                    seq,
                    entry: Some(entry),
                    queue: Arc::clone(&self.inner),
                })
            }
            None => Next::Empty,
        }
    }

    /// Entries waiting or in flight
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.pending.len().saturating_add(state.in_flight)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight,
            segments: state.segments.len(),
            disk_bytes: state.disk_usage(),
            dead_letter_bytes: state.dead_bytes,
            committed: state.cursor.committed(),
            next_seq: state.next_seq,
        }
    }

    /// Every entry in the dead-letter log, oldest first
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let prefix = self.inner.files.dead_prefix();
        let mut letters = Vec::new();
        for name in self.inner.store.list(&prefix)? {
            if QueueFiles::parse_numbered(&prefix, &name).is_none() {
                continue;
            }
            let data = self.inner.store.read(&name)?;
            let records = match read_segment(&data) {
                Ok((_, records)) => records,
                Err(e) => {
                    warn!(destination = %self.inner.name, file = %name, error = %e, "skipping unreadable dead-letter segment");
                    continue;
                }
            };
            for record in records {
                match bincode::deserialize::<DeadLetterRecord>(&record.payload) {
                    Ok(dead) => letters.push(DeadLetter {
                        seq: record.seq,
                        entry: dead.entry,
                        reason: dead.reason,
                    }),
                    Err(e) => {
                        warn!(destination = %self.inner.name, seq = record.seq, error = %e, "undecodable dead letter");
                    }
                }
            }
        }
        Ok(letters)
    }

    /// Delete the dead-letter log and release its disk budget. Returns the
    /// number of dead letters removed.
    pub fn clear_dead_letters(&self) -> Result<usize, QueueError> {
        let prefix = self.inner.files.dead_prefix();
        let mut state = self.inner.state.lock();
        state.dead = None;

        let mut removed = 0;
        for name in self.inner.store.list(&prefix)? {
            if QueueFiles::parse_numbered(&prefix, &name).is_none() {
                continue;
            }
            let data = self.inner.store.read(&name)?;
            self.inner.store.delete(&name)?;
            state.dead_bytes = state.dead_bytes.saturating_sub(data.len() as u64);
            removed += read_segment(&data).map(|(_, records)| records.len()).unwrap_or(0);
        }

        info!(destination = %self.inner.name, removed, "cleared dead-letter log");
        Ok(removed)
    }

    /// Sync, persist the cursor and release every file handle. Idempotent.
    pub fn close(&self) -> Result<(), QueueError> {
        let result = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            let mut result: Result<(), QueueError> = Ok(());
            if let Some(active) = state.active.as_mut() {
                if let Err(e) = active.sync() {
                    result = Err(e.into());
                }
            }
            if let Err(e) = self.inner.persist_cursor(&state) {
                result = result.and(Err(e));
            }
            state.active = None;
            state.dead = None;

            info!(
                destination = %self.inner.name,
                pending = state.pending.len(),
                in_flight = state.in_flight,
                "closed durable queue"
            );
            result
        };
        self.inner.notify.notify_waiters();
        result
    }
}

impl QueueInner {
    fn persist_cursor(&self, state: &QueueState) -> Result<(), QueueError> {
        self.store
            .replace(&self.files.cursor(), &state.cursor.encode())?;
        Ok(())
    }

    /// Delete fully settled segments other than the active one.
    fn truncate(&self, state: &mut QueueState) -> usize {
        let active = state.active.as_ref().map(|w| w.segment());
        let settled: Vec<u64> = state
            .segments
            .iter()
            .filter(|(segment, info)| info.live == 0 && Some(**segment) != active)
            .map(|(segment, _)| *segment)
            .collect();

        let mut deleted = 0;
        for segment in settled {
            let name = self.files.segment(segment);
            match self.store.delete(&name) {
                Ok(()) => {
                    state.segments.remove(&segment);
                    deleted += 1;
                }
                Err(e) => {
                    warn!(destination = %self.name, file = %name, error = %e, "failed to delete settled segment");
                }
            }
        }
        if deleted > 0 {
            debug!(destination = %self.name, deleted, "truncated settled segments");
        }
        deleted
    }

    fn ensure_capacity(&self, state: &mut QueueState, record: u64) -> Result<(), QueueError> {
        let limit = self.config.max_disk_bytes;
        if state.disk_usage().saturating_add(record) <= limit {
            return Ok(());
        }
        self.truncate(state);
        let usage = state.disk_usage();
        if usage.saturating_add(record) > limit {
            return Err(QueueError::Backpressure {
                destination: self.name.clone(),
                usage,
                record,
                limit,
            });
        }
        Ok(())
    }

    /// Open a fresh active segment
    fn rotate(&self, state: &mut QueueState) -> Result<(), StoreError> {
        state.active = None;
        let segment = state.next_segment;
        state.next_segment = segment
            .checked_add(1)
            .expect("segment overflow is unreachable");

        let file = self.store.create(&self.files.segment(segment))?;
        state.segments.insert(segment, SegmentInfo::default());
        let writer = SegmentWriter::new(file, segment)?;
        if let Some(info) = state.segments.get_mut(&segment) {
            info.bytes = writer.size();
        }
        state.active = Some(writer);
        Ok(())
    }

    /// Append and fsync one record. Returns the segment holding it.
    fn append_durable(
        &self,
        state: &mut QueueState,
        seq: u64,
        payload: Vec<u8>,
    ) -> Result<u64, StoreError> {
        let record = QueueRecord::new(seq, payload);
        let needs_rotation = match state.active.as_ref() {
            None => true,
            Some(active) => {
                active.record_count() > 0
                    && active.size().saturating_add(record.disk_size() as u64)
                        > self.config.max_segment_bytes as u64
            }
        };
        if needs_rotation {
            self.rotate(state)?;
        }

        let active = state
            .active
            .as_mut()
            .expect("active segment present after rotation is unreachable otherwise");
        let segment = active.segment();
        let result = active.append(&record).and_then(|_| active.sync());
        let size = active.size();
        if let Some(info) = state.segments.get_mut(&segment) {
            info.bytes = size;
        }
        result.map(|_| segment)
    }

    /// A failed append leaves an unusable tail: rotate next time and settle
    /// the seq so a torn record never resurfaces.
    fn abandon_hole(&self, state: &mut QueueState, seq: u64, error: &StoreError) {
        warn!(destination = %self.name, seq, error = %error, "queue append failed, rotating segment");
        state.active = None;
        state.settle(seq);
        if let Err(e) = self.persist_cursor(state) {
            warn!(destination = %self.name, error = %e, "failed to persist cursor");
        }
    }

    fn ack(&self, seq: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.settle(seq);
        let result = self.persist_cursor(&state);
        self.truncate(&mut state);
        result
    }

    fn nack(&self, seq: u64, entry: QueueEntry) -> Result<NackOutcome, QueueError> {
        let mut requeued = entry.clone();
        requeued.retry_count = requeued.retry_count.saturating_add(1);

        if requeued.retry_count > self.config.max_redeliveries {
            let reason = format!(
                "exceeded {} redeliveries",
                self.config.max_redeliveries
            );
            self.dead_letter(seq, requeued, reason)?;
            return Ok(NackOutcome::DeadLettered);
        }

        let payload = encode_payload(&requeued)?;
        let record_size = RECORD_OVERHEAD.saturating_add(payload.len()) as u64;
        let mut state = self.state.lock();
        if let Err(e) = self.ensure_capacity(&mut state, record_size) {
            // Keep the entry unsettled and in place; the caller backs off
            state.in_flight = state.in_flight.saturating_sub(1);
            state.pending.push_front((seq, entry));
            drop(state);
            self.notify.notify_one();
            return Err(e);
        }
        let new_seq = state.take_seq();
        match self.append_durable(&mut state, new_seq, payload) {
            Ok(segment) => {
                state.in_flight = state.in_flight.saturating_sub(1);
                state.seq_segment.insert(new_seq, segment);
                if let Some(info) = state.segments.get_mut(&segment) {
                    info.live = info.live.saturating_add(1);
                }
                state.settle(seq);
                state.pending.push_back((new_seq, requeued));
                let result = self.persist_cursor(&state);
                self.truncate(&mut state);
                drop(state);
                self.notify.notify_one();
                result.map(|_| NackOutcome::Requeued { seq: new_seq })
            }
            Err(e) => {
                self.abandon_hole(&mut state, new_seq, &e);
                state.in_flight = state.in_flight.saturating_sub(1);
                state.pending.push_front((seq, entry));
                drop(state);
                self.notify.notify_one();
                Err(e.into())
            }
        }
    }

    fn dead_letter(&self, seq: u64, entry: QueueEntry, reason: String) -> Result<(), QueueError> {
        let record = DeadLetterRecord { entry, reason };
        let payload = bincode::serialize(&record).map_err(|e| QueueError::Encode(e.to_string()))?;
        let record_size = RECORD_OVERHEAD.saturating_add(payload.len()) as u64;

        let mut state = self.state.lock();
        let written = self.append_dead(&mut state, seq, payload, record_size);
        state.in_flight = state.in_flight.saturating_sub(1);
        match written {
            Ok(()) => {
                warn!(
                    destination = %self.name,
                    seq,
                    event_id = %record.entry.row.event_id,
                    retry_count = record.entry.retry_count,
                    reason = %record.reason,
                    "entry moved to dead-letter log"
                );
                state.settle(seq);
                let result = self.persist_cursor(&state);
                self.truncate(&mut state);
                result
            }
            Err(e) => {
                warn!(destination = %self.name, seq, error = %e, "dead-letter append failed, entry kept");
                state.dead = None;
                state.pending.push_front((seq, record.entry));
                drop(state);
                self.notify.notify_one();
                Err(e.into())
            }
        }
    }

    fn append_dead(
        &self,
        state: &mut QueueState,
        seq: u64,
        payload: Vec<u8>,
        record_size: u64,
    ) -> Result<(), StoreError> {
        let needs_rotation = match state.dead.as_ref() {
            None => true,
            Some(dead) => {
                dead.record_count() > 0
                    && dead.size().saturating_add(record_size) > self.config.max_segment_bytes as u64
            }
        };
        if needs_rotation {
            state.dead = None;
            let segment = state.next_dead_segment;
            state.next_dead_segment = segment
                .checked_add(1)
                .expect("segment overflow is unreachable");
            let file = self.store.create(&self.files.dead_segment(segment))?;
            let writer = SegmentWriter::new(file, segment)?;
            state.dead_bytes = state.dead_bytes.saturating_add(writer.size());
            state.dead = Some(writer);
        }

        let dead = state
            .dead
            .as_mut()
            .expect("dead-letter segment present after rotation is unreachable otherwise");
        dead.append(&QueueRecord::new(seq, payload))?;
        let synced = dead.sync();
        state.dead_bytes = state.dead_bytes.saturating_add(record_size);
        synced
    }

    /// Return an unsettled delivery to the front of the queue
    fn release(&self, seq: u64, entry: QueueEntry) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.pending.push_front((seq, entry));
        }
        self.notify.notify_one();
    }
}

fn encode_payload(entry: &QueueEntry) -> Result<Vec<u8>, QueueError> {
    bincode::serialize(entry).map_err(|e| QueueError::Encode(e.to_string()))
}

fn recover(name: &str, files: &QueueFiles, store: &dyn QueueStore) -> Result<QueueState, QueueError> {
    let cursor_name = files.cursor();
    let mut cursor = if store.exists(&cursor_name)? {
        match Cursor::decode(&store.read(&cursor_name)?) {
            Some(cursor) => cursor,
            None => {
                warn!(destination = %name, "corrupt queue cursor, replaying all entries");
                Cursor::new()
            }
        }
    } else {
        Cursor::new()
    };

    let mut segments = BTreeMap::new();
    let mut seq_segment = HashMap::new();
    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    let mut max_seq: Option<u64> = None;
    let mut next_segment = 0u64;

    let prefix = files.segment_prefix();
    for file in store.list(&prefix)? {
        let Some(segment) = QueueFiles::parse_numbered(&prefix, &file) else {
            continue;
        };
        next_segment = next_segment.max(segment.saturating_add(1));

        let data = store.read(&file)?;
        let mut info = SegmentInfo {
            bytes: data.len() as u64,
            live: 0,
        };
        let records = match read_segment(&data) {
            Ok((_, records)) => records,
            Err(e) => {
                warn!(destination = %name, file = %file, error = %e, "unreadable queue segment");
                Vec::new()
            }
        };

        for record in records {
            max_seq = Some(max_seq.map_or(record.seq, |m| m.max(record.seq)));
            if cursor.is_settled(record.seq) || !seen.insert(record.seq) {
                continue;
            }
            match bincode::deserialize::<QueueEntry>(&record.payload) {
                Ok(entry) => {
                    info.live = info.live.saturating_add(1);
                    seq_segment.insert(record.seq, segment);
                    pending.push((record.seq, entry));
                }
                Err(e) => {
                    warn!(destination = %name, seq = record.seq, error = %e, "undecodable queue entry");
                }
            }
        }
        segments.insert(segment, info);
    }

    let next_seq = max_seq
        .map_or(0, |m| m.saturating_add(1))
        .max(cursor.next_free());

    // Sequence numbers that never made it to disk
    for seq in cursor.committed()..next_seq {
        if !seq_segment.contains_key(&seq) {
            cursor.settle(seq);
        }
    }

    let prefix = files.dead_prefix();
    let mut next_dead_segment = 0u64;
    let mut dead_bytes = 0u64;
    for file in store.list(&prefix)? {
        let Some(segment) = QueueFiles::parse_numbered(&prefix, &file) else {
            continue;
        };
        next_dead_segment = next_dead_segment.max(segment.saturating_add(1));
        dead_bytes = dead_bytes.saturating_add(store.read(&file)?.len() as u64);
    }

    pending.sort_by_key(|(seq, _)| *seq);

    Ok(QueueState {
        cursor,
        next_seq,
        next_segment,
        next_dead_segment,
        active: None,
        dead: None,
        segments,
        dead_bytes,
        seq_segment,
        pending: pending.into(),
        in_flight: 0,
        closed: false,
    })
}

/// A dequeued entry awaiting settlement.
///
/// Dropping it unsettled returns the entry to the front of the queue.
pub struct Delivery {
    seq: u64,
    entry: Option<QueueEntry>,
    queue: Arc<QueueInner>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("seq", &self.seq)
            .field("entry", &self.entry)
            .finish()
    }
}

impl Delivery {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn entry(&self) -> &QueueEntry {
        self.entry
            .as_ref()
            .expect("entry is present until settlement consumes the delivery")
    }

    pub fn retry_count(&self) -> u32 {
        self.entry().retry_count
    }

    fn take(&mut self) -> QueueEntry {
        self.entry
            .take()
            .expect("entry is present until settlement consumes the delivery")
    }

    /// Settle as delivered
    pub fn ack(mut self) -> Result<(), QueueError> {
        self.take();
        self.queue.ack(self.seq)
    }

    /// Settle as failed; requeue or dead-letter depending on the budget
    pub fn nack(mut self) -> Result<NackOutcome, QueueError> {
        let entry = self.take();
        self.queue.nack(self.seq, entry)
    }

    /// Move straight to the dead-letter log
    pub fn dead_letter(mut self, reason: impl Into<String>) -> Result<(), QueueError> {
        let entry = self.take();
        self.queue.dead_letter(self.seq, entry, reason.into())
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.queue.release(self.seq, entry);
        }
    }
}
