//! Lifecycle state of a storage proxy
//!
//! Batch: `Idle -> Flushing -> Idle`. Stream: `Idle -> Consuming <-> Retrying -> Idle`.
//! `Closed` is terminal.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyState {
    Idle = 0,
    Flushing = 1,
    Consuming = 2,
    Retrying = 3,
    Closed = 4,
}

impl ProxyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProxyState::Idle,
            1 => ProxyState::Flushing,
            2 => ProxyState::Consuming,
            3 => ProxyState::Retrying,
            4 => ProxyState::Closed,
            _ => unreachable!("invalid proxy state {}", v),
        }
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyState::Idle => "idle",
            ProxyState::Flushing => "flushing",
            ProxyState::Consuming => "consuming",
            ProxyState::Retrying => "retrying",
            ProxyState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Shared state cell; once `Closed`, transitions are ignored
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        StateCell(AtomicU8::new(ProxyState::Idle as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> ProxyState {
        ProxyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` unless closed. Returns whether the state changed.
    pub fn set(&self, next: ProxyState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ProxyState::Closed as u8).then_some(next as u8)
            })
            .is_ok()
    }

    /// Enter `Closed`. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.0.swap(ProxyState::Closed as u8, Ordering::AcqRel) != ProxyState::Closed as u8
    }

    pub fn is_closed(&self) -> bool {
        self.get() == ProxyState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_terminal() {
        let state = StateCell::default();
        assert_eq!(state.get(), ProxyState::Idle);
        assert!(state.set(ProxyState::Flushing));
        assert_eq!(state.get(), ProxyState::Flushing);

        assert!(state.close());
        assert!(!state.close());
        assert!(!state.set(ProxyState::Idle));
        assert_eq!(state.get(), ProxyState::Closed);
        assert_eq!(state.get().to_string(), "closed");
    }
}
