//! Bounded ingest queue
//!
//! A FIFO that never blocks the producer: when full, the oldest entry is
//! discarded to make room for the newest one.

use std::collections::VecDeque;

/// What happened to a pushed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, and the oldest entry was discarded to make room
    QueuedDroppingOldest,
    /// The queue was stopped; the entry was discarded
    Closed,
}

/// Keep-newest bounded FIFO
#[derive(Debug)]
pub struct IngestQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

impl<T> IngestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            dropped: 0,
        }
    }

    /// Enqueue without blocking
    pub fn push(&mut self, item: T) -> PushOutcome {
        if self.closed {
            self.dropped += 1;
            return PushOutcome::Closed;
        }

        let outcome = if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
            PushOutcome::QueuedDroppingOldest
        } else {
            PushOutcome::Queued
        };
        self.items.push_back(item);
        outcome
    }

    /// Oldest queued entry, if any
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Close the queue for new entries. Queued entries remain poppable.
    pub fn stop(&mut self) {
        self.closed = true;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Entries discarded by overflow or after close
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
