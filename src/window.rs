use crate::features;
use std::collections::VecDeque;

/// Fixed-capacity FIFO. Pushing into a full window evicts the oldest value.
///
/// The ring is re-aligned after every push so readers can borrow the
/// contents as one slice; the doubled allocation keeps that rotation rare.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity * 2),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.values.make_contiguous();
    }

    pub fn as_slice(&self) -> &[T] {
        self.values.as_slices().0
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

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

/// Output stabilizer shared by the physiological estimators.
///
/// Candidate values go into a bounded buffer; the visible value is the
/// buffer median or mean.
#[derive(Debug, Clone)]
pub struct Stabilizer {
    buffer: SlidingWindow<f64>,
}

impl Stabilizer {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: SlidingWindow::new(size),
        }
    }

    pub fn push(&mut self, value: f64) {
        if value.is_finite() {
            self.buffer.push(value);
        }
    }

    pub fn median(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(features::median(self.buffer.as_slice()))
    }

    pub fn mean(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(features::mean(self.buffer.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut window = SlidingWindow::new(3);
        for v in 1..=5 {
            window.push(v);
        }
        assert_eq!(window.as_slice(), &[3, 4, 5]);
        assert!(window.is_full());
    }

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let mut window = SlidingWindow::new(0);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.as_slice(), &[2.0]);
    }

    #[test]
    fn stabilizer_median_ignores_single_spike() {
        let mut stabilizer = Stabilizer::new(5);
        for v in [97.0, 98.0, 150.0, 97.0, 98.0] {
            stabilizer.push(v);
        }
        assert_eq!(stabilizer.median(), Some(98.0));
    }

    #[test]
    fn stabilizer_drops_non_finite_values() {
        let mut stabilizer = Stabilizer::new(5);
        stabilizer.push(f64::NAN);
        stabilizer.push(f64::INFINITY);
        assert!(stabilizer.is_empty());
        assert_eq!(stabilizer.median(), None);
    }

    #[test]
    fn stays_one_slice_across_many_wraps() {
        let mut window = SlidingWindow::new(4);
        for v in 0..1000 {
            window.push(v);
            let expected: Vec<i32> = ((v - 3).max(0)..=v).collect();
            assert_eq!(window.as_slice(), expected.as_slice());
        }
        assert_eq!(window.last(), Some(&999));
        assert_eq!(window.iter().copied().sum::<i32>(), 996 + 997 + 998 + 999);
    }
}
