//! Deadline-ordered heaps owned by the coordinator: the timer heap and the
//! lease-expiry heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::flease::{CellId, FleaseMessage, Lease};

/// One scheduled timer.
#[derive(Debug)]
struct TimerEntry {
    at_ms: i64,
    seq: u64,
    msg: FleaseMessage,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so that the max-heap pops the earliest deadline; equal
        // deadlines fire in scheduling order
        other
            .at_ms
            .cmp(&self.at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of internal timer events keyed by their scheduled time.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules `msg` to fire at synchronized time `at_ms`.
    pub(crate) fn schedule(&mut self, at_ms: i64, msg: FleaseMessage) {
        debug_assert!(msg.msg_type.is_internal_event());
        self.heap.push(TimerEntry {
            at_ms,
            seq: self.next_seq,
            msg,
        });
        self.next_seq += 1;
    }

    /// Earliest scheduled time, if any.
    pub(crate) fn next_deadline(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.at_ms)
    }

    /// Pops the earliest timer if it is due at `now_ms`.
    pub(crate) fn pop_due(&mut self, now_ms: i64) -> Option<(i64, FleaseMessage)> {
        if self.heap.peek()?.at_ms <= now_ms {
            self.heap.pop().map(|e| (e.at_ms, e.msg))
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

/// One tracked lease timeout.
#[derive(Debug)]
struct ExpiryEntry {
    lease: Lease,
}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExpiryEntry {}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed for min-heap behavior; identical timeouts are broken by
        // cell ID so that the sweep order is deterministic
        other
            .lease
            .timeout_ms
            .cmp(&self.lease.timeout_ms)
            .then_with(|| other.lease.cell.cmp(&self.lease.cell))
    }
}

/// Min-heap of learned leases keyed by timeout.
///
/// Superseded entries are not searched for and removed eagerly; the sweep
/// caller checks every popped lease against the cell's current lease and
/// skips those that no longer match.
#[derive(Debug, Default)]
pub(crate) struct ExpiryHeap {
    heap: BinaryHeap<ExpiryEntry>,
}

impl ExpiryHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, lease: Lease) {
        debug_assert!(!lease.is_empty());
        self.heap.push(ExpiryEntry { lease });
    }

    /// Pops the earliest lease if its timeout is at or before `deadline_ms`.
    pub(crate) fn pop_due(&mut self, deadline_ms: i64) -> Option<Lease> {
        if self.heap.peek()?.lease.timeout_ms <= deadline_ms {
            self.heap.pop().map(|e| e.lease)
        } else {
            None
        }
    }

    /// Earliest tracked timeout, if any.
    #[cfg(test)]
    pub(crate) fn next_timeout(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.lease.timeout_ms)
    }

    /// Number of entries tracked for given cell, stale ones included.
    #[cfg(test)]
    pub(crate) fn count_for(&self, cell: &CellId) -> usize {
        self.heap.iter().filter(|e| &e.lease.cell == cell).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
