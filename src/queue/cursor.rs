//! Consumer cursor: which sequence numbers are settled.
//!
//! Layout: magic "EVQC" | crc32 u32 LE | bincode(Cursor). A cursor that fails
//! to decode is treated as absent, which replays everything (at least once).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const CURSOR_MAGIC: [u8; 4] = *b"EVQC";
const CURSOR_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Every seq below this is settled
    committed: u64,
    /// Settled seqs at or above `committed`
    settled_above: BTreeSet<u64>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn is_settled(&self, seq: u64) -> bool {
        seq < self.committed || self.settled_above.contains(&seq)
    }

    /// Mark a seq settled. Returns false if it already was.
    pub fn settle(&mut self, seq: u64) -> bool {
        if self.is_settled(seq) {
            return false;
        }
        self.settled_above.insert(seq);
        while self.settled_above.remove(&self.committed) {
            self.committed = self
                .committed
                .checked_add(1)
                .expect("sequence overflow is unreachable");
        }

        debug_assert!(
            self.settled_above.iter().all(|s| *s > self.committed),
            "Postcondition: settled_above must lie strictly above the watermark"
        );
        true
    }

    /// Smallest seq that is safe to assign next
    pub fn next_free(&self) -> u64 {
        self.settled_above
            .iter()
            .next_back()
            .map(|s| s.saturating_add(1))
            .unwrap_or(0)
            .max(self.committed)
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = bincode::serialize(self).expect("cursor serialization is infallible");
        let mut buf = Vec::with_capacity(CURSOR_HEADER_SIZE + body.len());
        buf.extend_from_slice(&CURSOR_MAGIC);
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < CURSOR_HEADER_SIZE || data[0..4] != CURSOR_MAGIC {
            return None;
        }
        let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let body = &data[CURSOR_HEADER_SIZE..];
        if crc32fast::hash(body) != checksum {
            return None;
        }
        bincode::deserialize(body).ok()
    }
}
