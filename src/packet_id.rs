//! Packet identifier allocation.
//!
//! MQTT packet ids are 16-bit, nonzero, and must be unique among in-flight
//! exchanges. The allocator keeps a set of ids currently in use and a
//! wrapping counter that skips over them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    next_free: u16,
    in_flight: BTreeSet<u16>,
}

/// Issues and recycles unique 16-bit packet identifiers. Thread-safe.
#[derive(Debug)]
pub struct IdManager {
    inner: Mutex<Inner>,
}

/// Snapshot form: `{"next": u16, "inFlight": [u16, ...]}` with `inFlight`
/// omitted when empty and listed in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdManagerState {
    pub next: u16,
    #[serde(
        rename = "inFlight",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub in_flight: Vec<u16>,
}

impl IdManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_free: 1,
                in_flight: BTreeSet::new(),
            }),
        }
    }

    /// Returns an id not currently in flight and marks it in flight.
    ///
    /// The counter is advanced before use, wraps 0 to 1, and steps over any
    /// id still in flight, so 0 is never handed out and no id is issued
    /// twice without an intervening [`release`](Self::release).
    pub fn allocate(&self) -> u16 {
        let mut inner = self.inner.lock().expect("id manager lock");
        loop {
            inner.next_free = inner.next_free.wrapping_add(1);
            if inner.next_free == 0 {
                inner.next_free = 1;
            }
            if !inner.in_flight.contains(&inner.next_free) {
                break;
            }
        }
        let id = inner.next_free;
        inner.in_flight.insert(id);
        id
    }

    /// Removes `id` from the in-flight set.
    pub fn release(&self, id: u16) {
        let mut inner = self.inner.lock().expect("id manager lock");
        inner.in_flight.remove(&id);
    }

    #[must_use]
    pub fn snapshot(&self) -> IdManagerState {
        let inner = self.inner.lock().expect("id manager lock");
        IdManagerState {
            next: inner.next_free,
            in_flight: inner.in_flight.iter().copied().collect(),
        }
    }

    pub fn restore(&self, state: &IdManagerState) {
        let mut inner = self.inner.lock().expect("id manager lock");
        inner.next_free = state.next;
        inner.in_flight = state.in_flight.iter().copied().collect();
    }
}

impl Default for IdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_allocation_skips_zero_and_one() {
        let ids = IdManager::new();
        // The counter is advanced before use, so allocation starts at 2.
        assert_eq!(ids.allocate(), 2);
        assert_eq!(ids.allocate(), 3);
    }

    #[test]
    fn test_wraparound_skips_zero_and_in_flight() {
        let ids = IdManager::new();
        ids.restore(&IdManagerState {
            next: u16::MAX - 1,
            in_flight: vec![1, 2],
        });
        assert_eq!(ids.allocate(), u16::MAX);
        // 0 is skipped, then 1 and 2 are in flight.
        assert_eq!(ids.allocate(), 3);
    }

    #[test]
    fn test_release_makes_id_reusable() {
        let ids = IdManager::new();
        let a = ids.allocate();
        ids.release(a);
        ids.restore(&IdManagerState {
            next: a - 1,
            in_flight: vec![],
        });
        assert_eq!(ids.allocate(), a);
    }

    #[test]
    fn test_json_roundtrip() {
        let ids = IdManager::new();
        ids.allocate();
        ids.allocate();
        let state = ids.snapshot();
        let js = serde_json::to_string(&state).unwrap();
        assert_eq!(js, r#"{"next":3,"inFlight":[2,3]}"#);
        let back: IdManagerState = serde_json::from_str(&js).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_json_empty_in_flight_omitted() {
        let state = IdManagerState {
            next: 1,
            in_flight: vec![],
        };
        assert_eq!(serde_json::to_string(&state).unwrap(), r#"{"next":1}"#);
        let back: IdManagerState = serde_json::from_str(r#"{"next":1}"#).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_concurrent_uniqueness() {
        let ids = Arc::new(IdManager::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| ids.allocate()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert!(!all.contains(&0));
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before, "duplicate id issued");
    }
}
