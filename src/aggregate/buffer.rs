use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::models::Timestamped;

/// Bounded FIFO of finalized records for one (symbol, timeframe) pair.
///
/// Capacity is fixed at construction. When a push would exceed it, the single
/// oldest record is evicted before the new one is appended. Records are
/// value-copied in; readers get copies back out, so producers and consumers
/// never share mutable state.
#[derive(Debug)]
pub struct RollingBuffer<T> {
    records: VecDeque<T>,
    capacity: usize,
}

impl<T: Timestamped + Clone> RollingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "rolling buffer capacity must be positive");
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, evicting the oldest one first if the buffer is full.
    pub fn push(&mut self, record: T) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// The most recent `min(n, len)` records in chronological order.
    pub fn get_last(&self, n: usize) -> Vec<T> {
        let take = n.min(self.records.len());
        self.records
            .iter()
            .skip(self.records.len() - take)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn oldest_datetime(&self) -> Option<DateTime<Utc>> {
        self.records.front().map(Timestamped::datetime)
    }

    pub fn newest_datetime(&self) -> Option<DateTime<Utc>> {
        self.records.back().map(Timestamped::datetime)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
