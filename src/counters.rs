//! Global identifier counters.
//!
//! Record, node and oracle identifiers are allocated from independent
//! monotonic counters. A value handed out is never handed out again, even
//! when the operation that consumed it fails.

use parking_lot::Mutex;
use std::ops::Range;

/// A monotonic identifier source guarded by its own lock.
#[derive(Debug)]
pub struct IdCounter {
    next: Mutex<u64>,
}

impl IdCounter {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Mutex::new(first.max(1)),
        }
    }

    /// Hand out the next identifier.
    pub fn allocate(&self) -> u64 {
        let mut next = self.next.lock();
        let id = *next;
        *next += 1;
        id
    }

    /// Hand out `count` contiguous identifiers.
    pub fn allocate_many(&self, count: u64) -> Range<u64> {
        let mut next = self.next.lock();
        let start = *next;
        *next += count;
        start..*next
    }

    /// Make sure `used` will never be allocated.
    pub fn bump_floor(&self, used: u64) {
        let mut next = self.next.lock();
        if *next <= used {
            *next = used + 1;
        }
    }

    /// The identifier the next `allocate` would return.
    pub fn peek(&self) -> u64 {
        *self.next.lock()
    }
}

/// The three counters of a cluster, shared by the router, the oracle
/// catalog and the node registry.
#[derive(Debug)]
pub struct Counters {
    pub records: IdCounter,
    pub nodes: IdCounter,
    pub oracles: IdCounter,
}

impl Counters {
    pub fn new(first_node_id: u64) -> Self {
        Self {
            records: IdCounter::starting_at(1),
            nodes: IdCounter::starting_at(first_node_id),
            oracles: IdCounter::starting_at(1),
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_monotonic() {
        let counter = IdCounter::starting_at(1);
        assert_eq!(counter.allocate(), 1);
        assert_eq!(counter.allocate(), 2);
        assert_eq!(counter.allocate_many(3), 3..6);
        assert_eq!(counter.peek(), 6);
    }

    #[test]
    fn bump_floor_only_moves_forward() {
        let counter = IdCounter::starting_at(10);
        counter.bump_floor(4);
        assert_eq!(counter.peek(), 10);
        counter.bump_floor(10);
        assert_eq!(counter.allocate(), 11);
        counter.bump_floor(40);
        assert_eq!(counter.allocate(), 41);
    }

    #[test]
    fn zero_is_never_handed_out() {
        let counter = IdCounter::starting_at(0);
        assert_eq!(counter.allocate(), 1);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let counter = std::sync::Arc::new(IdCounter::starting_at(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..100).map(|_| counter.allocate()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }
}
