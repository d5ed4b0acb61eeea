//! Bounded per-signal time series.
//!
//! The extractor is the single writer (one push per detected frame); the
//! calibrator and challenge validators only ever read recent windows. Readers
//! must treat a short window as "not enough data yet", never as an error.

use std::collections::vec_deque::{Iter, VecDeque};

use crate::signals::{HeadOffset, SignalSample};

/// Default number of samples retained per signal (≈4 s at 30 fps).
pub const DEFAULT_HISTORY_CAPACITY: usize = 120;

/// Upper bound on up-front allocation; larger buffers grow on demand.
const PREALLOCATE_MAX: usize = 1024;

/// FIFO buffer that evicts its oldest entries once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct HistoryBuffer<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryBuffer<T> {
    /// Create an empty buffer. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity.min(PREALLOCATE_MAX)),
            capacity,
        }
    }

    /// Append a value, evicting from the front while over capacity.
    pub fn push(&mut self, value: T) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    /// The last `k` values in arrival order, or fewer if not yet available.
    pub fn window(&self, k: usize) -> Iter<'_, T> {
        let start = self.values.len().saturating_sub(k);
        self.values.range(start..)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        self.values.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.values.back()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl<T> Default for HistoryBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// The three signal histories of one session.
#[derive(Debug, Clone, Default)]
pub struct SignalHistory {
    pub ear: HistoryBuffer<f32>,
    pub mouth_ratio: HistoryBuffer<f32>,
    pub head_offset: HistoryBuffer<HeadOffset>,
}

impl SignalHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ear: HistoryBuffer::new(capacity),
            mouth_ratio: HistoryBuffer::new(capacity),
            head_offset: HistoryBuffer::new(capacity),
        }
    }

    /// Push one frame's signals into all three buffers.
    pub fn record(&mut self, sample: &SignalSample) {
        self.ear.push(sample.ear);
        self.mouth_ratio.push(sample.mouth_ratio);
        self.head_offset.push(sample.head_offset);
    }

    /// Number of frames recorded (all buffers advance together).
    pub fn len(&self) -> usize {
        self.ear.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ear.is_empty()
    }

    pub fn clear(&mut self) {
        self.ear.clear();
        self.mouth_ratio.clear();
        self.head_offset.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_five_keeps_latest() {
        let mut buf = HistoryBuffer::new(5);
        for i in 1..=8 {
            buf.push(i);
        }
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut buf = HistoryBuffer::new(3);
        for i in 0..100 {
            buf.push(i);
            assert!(buf.len() <= 3);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![97, 98, 99]);
    }

    #[test]
    fn test_huge_capacity_allocates_lazily() {
        let mut buf = HistoryBuffer::new(usize::MAX);
        buf.push(1u8);
        buf.push(2u8);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.window(5).copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_window_short_history() {
        let mut buf = HistoryBuffer::new(10);
        buf.push(1.0f32);
        buf.push(2.0);
        let w: Vec<f32> = buf.window(12).copied().collect();
        assert_eq!(w, vec![1.0, 2.0]);
        assert_eq!(HistoryBuffer::<f32>::new(4).window(3).count(), 0);
    }

    #[test]
    fn test_window_returns_tail_in_order() {
        let mut buf = HistoryBuffer::new(10);
        for i in 0..10 {
            buf.push(i);
        }
        assert_eq!(buf.window(3).copied().collect::<Vec<_>>(), vec![7, 8, 9]);
        assert_eq!(buf.last(), Some(&9));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut buf = HistoryBuffer::new(0);
        buf.push('a');
        buf.push('b');
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.iter().copied().collect::<String>(), "b");
    }

    #[test]
    fn test_signal_history_records_all_three() {
        let mut history = SignalHistory::new(2);
        let sample = SignalSample {
            ear: 0.3,
            mouth_ratio: 1.4,
            head_offset: HeadOffset { x: 0.1, y: -0.2 },
        };
        history.record(&sample);
        history.record(&sample);
        history.record(&sample);

        assert_eq!(history.len(), 2);
        assert_eq!(history.mouth_ratio.len(), 2);
        assert_eq!(history.head_offset.last(), Some(&sample.head_offset));

        history.clear();
        assert!(history.is_empty());
        assert!(history.head_offset.is_empty());
    }
}
