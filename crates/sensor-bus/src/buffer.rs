//! Bounded receive buffer ("keep last N" per producer).
//!
//! Each producer gets its own FIFO of at most `capacity` readings. When a
//! producer's queue is full the oldest entry is dropped to make room, so a
//! fast publisher can never grow a slow consumer's memory without bound and
//! the consumer always sees the freshest window.
//!
//! Readings are handed out in global arrival order across producers.

use crate::peer_id::PeerId;
use crate::reading::Reading;
use std::collections::{HashMap, VecDeque};

pub struct ReceiveBuffer {
    capacity: usize,
    queues: HashMap<PeerId, VecDeque<(u64, Reading)>>,
    next_arrival: u64,
    len: usize,
}

impl ReceiveBuffer {
    /// Create a buffer holding at most `capacity` readings per producer.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: HashMap::new(),
            next_arrival: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a reading from `producer`.
    ///
    /// Returns the evicted reading if the producer's queue was already full.
    pub fn push(&mut self, producer: &PeerId, reading: Reading) -> Option<Reading> {
        let arrival = self.next_arrival;
        self.next_arrival += 1;

        let queue = self.queues.entry(producer.clone()).or_default();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front().map(|(_, r)| r)
        } else {
            self.len += 1;
            None
        };
        queue.push_back((arrival, reading));
        evicted
    }

    /// Take the oldest buffered reading across all producers.
    pub fn pop(&mut self) -> Option<Reading> {
        let producer = self
            .queues
            .iter()
            .filter_map(|(id, q)| q.front().map(|(arrival, _)| (*arrival, id)))
            .min_by_key(|(arrival, _)| *arrival)
            .map(|(_, id)| id.clone())?;

        let queue = self.queues.get_mut(&producer)?;
        let (_, reading) = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&producer);
        }
        self.len -= 1;
        Some(reading)
    }

    /// Total buffered readings.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffered readings from one producer.
    pub fn len_for(&self, producer: &PeerId) -> usize {
        self.queues.get(producer).map(VecDeque::len).unwrap_or(0)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.queues.clear();
        self.len = 0;
    }
}
