use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

/// Source of index choices for proxy providers, proxy list entries and
/// User-Agent strings.
pub trait Selector: Send + Sync {
    /// Index in `0..len`. Callers never pass `len == 0`.
    fn pick(&self, len: usize) -> usize;
}

/// Uniform choice backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSelector;

impl Selector for ThreadRngSelector {
    fn pick(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// Replays a fixed sequence of indices (each taken modulo `len`), cycling when
/// exhausted.
#[derive(Debug)]
pub struct SequenceSelector {
    seq: Vec<usize>,
    cursor: AtomicUsize,
}

impl SequenceSelector {
    pub fn new(seq: impl Into<Vec<usize>>) -> Self {
        Self { seq: seq.into(), cursor: AtomicUsize::new(0) }
    }
}

impl Selector for SequenceSelector {
    fn pick(&self, len: usize) -> usize {
        if self.seq.is_empty() {
            return 0;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.seq.len();
        self.seq[i] % len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_selector_cycles_and_wraps() {
        let s = SequenceSelector::new(vec![1, 5]);
        assert_eq!(s.pick(3), 1);
        assert_eq!(s.pick(3), 2);
        assert_eq!(s.pick(3), 1);
    }

    #[test]
    fn test_sequence_selector_shared_across_threads() {
        let s = std::sync::Arc::new(SequenceSelector::new(vec![0, 1, 2, 3]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.pick(4))
            })
            .collect();
        let mut picked: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        picked.sort_unstable();
        assert_eq!(picked, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_thread_rng_selector_in_range() {
        for _ in 0..64 {
            assert!(ThreadRngSelector.pick(4) < 4);
        }
    }
}
