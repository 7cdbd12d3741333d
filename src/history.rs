//! Bounded history of decoded timecode samples.
//!
//! Two windows over the same stream:
//! - a short FIFO (configurable, 5..=30, default 15) feeding the pattern analyzer
//! - a fixed 20-entry ring buffer kept for noise statistics
//!
//! Both evict the oldest sample on overflow. Reads are chronological
//! (oldest first).

use std::collections::VecDeque;

pub const MIN_CAPACITY: usize = 5;
pub const MAX_CAPACITY: usize = 30;
pub const DEFAULT_CAPACITY: usize = 15;
pub const RING_SIZE: usize = 20;

/// One decoded timecode, stamped with the reference clock at capture time
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Monotonic reference clock, seconds
    pub reference_clock: f64,
    /// Decoded timecode position, seconds
    pub timecode_seconds: f64,
    pub timecode: String,
}

impl Sample {
    pub fn new(reference_clock: f64, timecode_seconds: f64, timecode: impl Into<String>) -> Self {
        Sample {
            reference_clock,
            timecode_seconds,
            timecode: timecode.into(),
        }
    }
}

#[derive(Debug)]
pub struct SampleHistory {
    recent: VecDeque<Sample>,
    capacity: usize,
    ring: VecDeque<Sample>,
    total_pushed: u64,
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SampleHistory {
    /// `capacity` is clamped to `MIN_CAPACITY..=MAX_CAPACITY`
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        SampleHistory {
            recent: VecDeque::with_capacity(capacity + 1),
            capacity,
            ring: VecDeque::with_capacity(RING_SIZE + 1),
            total_pushed: 0,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        self.total_pushed += 1;

        self.ring.push_back(sample.clone());
        if self.ring.len() > RING_SIZE {
            self.ring.pop_front();
        }

        self.recent.push_back(sample);
        if self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
    }

    /// Most recent `n` samples of the short FIFO, oldest first
    pub fn last_n(&self, n: usize) -> Vec<Sample> {
        let n = n.min(self.recent.len());
        self.recent.iter().skip(self.recent.len() - n).cloned().collect()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.recent.back()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinking drops the oldest samples
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
    }

    /// Ring buffer contents, oldest first
    pub fn ring(&self) -> Vec<Sample> {
        self.ring.iter().cloned().collect()
    }

    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    /// Clears the analyzer window only; the ring keeps feeding statistics
    pub fn clear(&mut self) {
        self.recent.clear();
    }

    pub fn clear_all(&mut self) {
        self.recent.clear();
        self.ring.clear();
    }
}
