//! Queue Segment Format and File Naming
//!
//! ## Segment Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "EVQL" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - segment: u64 LE                │
//! ├──────────────────────────────────┤
//! │ Record 0                         │
//! │ - payload_length: u32 LE         │
//! │ - seq: u64 LE                    │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - payload: [u8; payload_length]  │
//! ├──────────────────────────────────┤
//! │ Record 1 ...                     │
//! └──────────────────────────────────┘
//! ```
//!
//! Each record is individually checksummed. The reader stops at the first
//! truncated or corrupt record, so a torn tail loses only unacknowledged
//! appends.

use super::store::{SegmentFileWriter, StoreError};

pub const SEGMENT_MAGIC: [u8; 4] = *b"EVQL";
pub const SEGMENT_VERSION: u8 = 1;
pub const SEGMENT_HEADER_SIZE: usize = 16;
/// payload_length(4) + seq(8) + checksum(4)
pub const RECORD_OVERHEAD: usize = 16;

const FILE_PREFIX: &str = "queue.dst=";
const SEGMENT_SUFFIX: &str = ".log";

/// Escape a destination name for use in file names.
///
/// Bytes outside `[A-Za-z0-9_-]` become `%XX`, so distinct destinations never
/// share a file.
pub fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// File names owned by one destination queue
#[derive(Debug, Clone)]
pub struct QueueFiles {
    escaped: String,
}

impl QueueFiles {
    pub fn new(destination: &str) -> Self {
        debug_assert!(!destination.is_empty(), "Precondition: destination must not be empty");
        QueueFiles {
            escaped: escape_name(destination),
        }
    }

    /// `queue.dst=<name>`
    pub fn base(&self) -> String {
        format!("{}{}", FILE_PREFIX, self.escaped)
    }

    pub fn segment_prefix(&self) -> String {
        format!("{}-", self.base())
    }

    pub fn segment(&self, segment: u64) -> String {
        format!("{}{:08x}{}", self.segment_prefix(), segment, SEGMENT_SUFFIX)
    }

    pub fn cursor(&self) -> String {
        format!("{}.cursor", self.base())
    }

    pub fn dead_prefix(&self) -> String {
        format!("{}.dead-", self.base())
    }

    pub fn dead_segment(&self, segment: u64) -> String {
        format!("{}{:08x}{}", self.dead_prefix(), segment, SEGMENT_SUFFIX)
    }

    /// Segment number of a file listed under `prefix`, if the name is exactly
    /// `<prefix><8 hex digits>.log`.
    pub fn parse_numbered(prefix: &str, name: &str) -> Option<u64> {
        let digits = name.strip_prefix(prefix)?.strip_suffix(SEGMENT_SUFFIX)?;
        if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(digits, 16).ok()
    }
}

/// A single framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl QueueRecord {
    pub fn new(seq: u64, payload: Vec<u8>) -> Self {
        debug_assert!(!payload.is_empty(), "Precondition: payload must not be empty");
        QueueRecord { seq, payload }
    }

    /// Total size on disk
    pub fn disk_size(&self) -> usize {
        RECORD_OVERHEAD
            .checked_add(self.payload.len())
            .expect("record size overflow is unreachable for payload < u32::MAX")
    }

    pub fn encode(&self) -> Vec<u8> {
        let total_size = self.disk_size();
        let mut buf = Vec::with_capacity(total_size);

        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&self.payload).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        debug_assert_eq!(buf.len(), total_size, "Postcondition: encoded size must match");
        buf
    }

    /// Decode one record. Returns None if the bytes are truncated or corrupt.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < RECORD_OVERHEAD {
            return None;
        }

        let payload_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let seq = u64::from_le_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let checksum = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);

        let total_size = RECORD_OVERHEAD.checked_add(payload_len)?;
        if payload_len == 0 || data.len() < total_size {
            return None;
        }

        let payload = &data[RECORD_OVERHEAD..total_size];
        if crc32fast::hash(payload) != checksum {
            return None;
        }

        Some((
            QueueRecord {
                seq,
                payload: payload.to_vec(),
            },
            total_size,
        ))
    }
}

fn encode_header(segment: u64) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    header[4] = SEGMENT_VERSION;
    header[5] = 0; // flags
    // header[6..8] reserved
    header[8..16].copy_from_slice(&segment.to_le_bytes());
    header
}

/// Appends records to one segment file
pub struct SegmentWriter {
    writer: Box<dyn SegmentFileWriter>,
    segment: u64,
    record_count: u64,
}

impl SegmentWriter {
    /// Wrap a fresh file and write its header immediately.
    pub fn new(mut writer: Box<dyn SegmentFileWriter>, segment: u64) -> Result<Self, StoreError> {
        writer.append(&encode_header(segment))?;
        Ok(SegmentWriter {
            writer,
            segment,
            record_count: 0,
        })
    }

    /// Append a record (does NOT fsync)
    pub fn append(&mut self, record: &QueueRecord) -> Result<u64, StoreError> {
        let offset = self.writer.append(&record.encode())?;
        self.record_count = self
            .record_count
            .checked_add(1)
            .expect("record count overflow is unreachable");
        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.writer.sync()
    }

    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }
}

/// Why a segment could not be read at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentReadError {
    TooShort,
    BadMagic,
    UnsupportedVersion(u8),
}

impl std::fmt::Display for SegmentReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentReadError::TooShort => write!(f, "segment too short for header"),
            SegmentReadError::BadMagic => write!(f, "invalid segment magic"),
            SegmentReadError::UnsupportedVersion(v) => {
                write!(f, "unsupported segment version: {}", v)
            }
        }
    }
}

/// Parse a segment: header then every intact record up to the first bad one.
pub fn read_segment(data: &[u8]) -> Result<(u64, Vec<QueueRecord>), SegmentReadError> {
    if data.len() < SEGMENT_HEADER_SIZE {
        return Err(SegmentReadError::TooShort);
    }
    if data[0..4] != SEGMENT_MAGIC {
        return Err(SegmentReadError::BadMagic);
    }
    if data[4] != SEGMENT_VERSION {
        return Err(SegmentReadError::UnsupportedVersion(data[4]));
    }
    let segment = u64::from_le_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]);

    let mut records = Vec::new();
    let mut offset = SEGMENT_HEADER_SIZE;
    while offset < data.len() {
        match QueueRecord::decode(&data[offset..]) {
            Some((record, consumed)) => {
                records.push(record);
                offset = offset
                    .checked_add(consumed)
                    .expect("offset overflow is unreachable");
            }
            None => break,
        }
    }
    Ok((segment, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::{InMemoryQueueStore, QueueStore};

    #[test]
    fn test_escape_name() {
        assert_eq!(escape_name("pg_main-1"), "pg_main-1");
        assert_eq!(escape_name("a.dead"), "a%2Edead");
        assert_eq!(escape_name("a/b c"), "a%2Fb%20c");
        assert_eq!(escape_name("%"), "%25");
    }

    #[test]
    fn test_file_names_do_not_collide() {
        let a = QueueFiles::new("a");
        let a_dead = QueueFiles::new("a.dead");
        assert_eq!(a.segment(1), "queue.dst=a-00000001.log");
        assert_eq!(a.cursor(), "queue.dst=a.cursor");
        assert_eq!(a.dead_segment(0), "queue.dst=a.dead-00000000.log");
        assert_ne!(a.dead_segment(0), a_dead.segment(0));
    }

    #[test]
    fn test_parse_numbered_is_strict() {
        let a = QueueFiles::new("a");
        let prefix = a.segment_prefix();
        assert_eq!(QueueFiles::parse_numbered(&prefix, &a.segment(0x2f)), Some(0x2f));
        // Segment of destination "a-00000001"
        let other = QueueFiles::new("a-00000001").segment(0);
        assert_eq!(QueueFiles::parse_numbered(&prefix, &other), None);
        assert_eq!(QueueFiles::parse_numbered(&prefix, "queue.dst=a-zz.log"), None);
    }

    #[test]
    fn test_record_encode_decode() {
        let record = QueueRecord::new(42, b"payload".to_vec());
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.disk_size());

        let (decoded, consumed) = QueueRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_record_corruption_detected() {
        let mut encoded = QueueRecord::new(1, b"payload".to_vec()).encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(QueueRecord::decode(&encoded).is_none());
        assert!(QueueRecord::decode(&encoded[..10]).is_none());
    }

    #[test]
    fn test_segment_write_read() {
        let store = InMemoryQueueStore::new();
        let mut writer = SegmentWriter::new(store.create("seg").unwrap(), 3).unwrap();
        for seq in 0..5 {
            writer
                .append(&QueueRecord::new(seq, format!("row-{}", seq).into_bytes()))
                .unwrap();
        }
        writer.sync().unwrap();
        assert_eq!(writer.record_count(), 5);

        let (segment, records) = read_segment(&store.read("seg").unwrap()).unwrap();
        assert_eq!(segment, 3);
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].payload, b"row-4");
    }

    #[test]
    fn test_segment_torn_tail() {
        let store = InMemoryQueueStore::new();
        let mut writer = SegmentWriter::new(store.create("seg").unwrap(), 0).unwrap();
        writer.append(&QueueRecord::new(0, b"first".to_vec())).unwrap();
        writer.append(&QueueRecord::new(1, b"second".to_vec())).unwrap();

        let mut data = store.read("seg").unwrap();
        data.truncate(data.len() - 3);
        let (_, records) = read_segment(&data).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 0);
    }

    #[test]
    fn test_segment_bad_header() {
        assert_eq!(read_segment(b"EVQ"), Err(SegmentReadError::TooShort));
        let mut data = encode_header(0).to_vec();
        data[0] = b'X';
        assert_eq!(read_segment(&data), Err(SegmentReadError::BadMagic));
    }
}
