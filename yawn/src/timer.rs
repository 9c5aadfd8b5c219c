//! Deadline timer driving idle-connection eviction.
//!
//! A binary min-heap of `(id, deadline, callback)` entries with an auxiliary
//! `id -> heap index` map kept in sync on every swap, so re-arming an
//! existing id is O(log n) instead of a scan. The reactor asks
//! [`TimerHeap::next_tick`] for its poll timeout; expired callbacks run
//! there, on the reactor thread.
//!
//! An expired entry is detached from the heap *before* its callback runs,
//! so callbacks may add or remove other ids without corrupting the heap.
//! Entries with equal deadlines fire in unspecified order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    id: u64,
    deadline: Instant,
    callback: TimerCallback,
}

#[derive(Default)]
pub struct TimerHeap {
    heap: Vec<TimerEntry>,
    index: HashMap<u64, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Arm (or re-arm) `id` to fire `callback` after `timeout`. Re-arming
    /// an existing id replaces both its deadline and its callback.
    pub fn add<F>(&mut self, id: u64, timeout: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        if let Some(&idx) = self.index.get(&id) {
            self.heap[idx].deadline = deadline;
            self.heap[idx].callback = Box::new(callback);
            if !self.sift_down(idx, self.heap.len()) {
                self.sift_up(idx);
            }
        } else {
            let idx = self.heap.len();
            self.index.insert(id, idx);
            self.heap.push(TimerEntry {
                id,
                deadline,
                callback: Box::new(callback),
            });
            self.sift_up(idx);
        }
    }

    /// Push the deadline of an existing entry out to `timeout` from now.
    /// Returns `false` if `id` is not armed.
    pub fn adjust(&mut self, id: u64, timeout: Duration) -> bool {
        let idx = match self.index.get(&id) {
            Some(&idx) => idx,
            None => return false,
        };
        self.heap[idx].deadline = Instant::now() + timeout;
        if !self.sift_down(idx, self.heap.len()) {
            self.sift_up(idx);
        }
        true
    }

    /// Disarm `id` without firing its callback. Returns `false` if absent.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.index.get(&id).copied() {
            Some(idx) => self.detach(idx).is_some(),
            None => false,
        }
    }

    /// Remove the root entry without firing it, returning its id.
    pub fn pop(&mut self) -> Option<u64> {
        self.detach(0).map(|entry| entry.id)
    }

    /// Fire every entry whose deadline has passed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.deadline > now {
                break;
            }
            if let Some(entry) = self.detach(0) {
                (entry.callback)();
            }
        }
    }

    /// Fire expired entries, then return the milliseconds until the next
    /// deadline (clamped to zero), or `-1` if nothing is armed — the value
    /// feeds straight into `epoll_wait`.
    pub fn next_tick(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            Some(root) => {
                let remaining = root.deadline.saturating_duration_since(Instant::now());
                remaining.as_millis().min(i32::MAX as u128) as i32
            }
            None => -1,
        }
    }

    /// Remove the entry at `idx`, returning it with its callback unfired.
    fn detach(&mut self, idx: usize) -> Option<TimerEntry> {
        if idx >= self.heap.len() {
            return None;
        }
        let last = self.heap.len() - 1;
        if idx < last {
            self.swap_nodes(idx, last);
            if !self.sift_down(idx, last) {
                self.sift_up(idx);
            }
        }
        let entry = self.heap.pop()?;
        self.index.remove(&entry.id);
        Some(entry)
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[parent].deadline < self.heap[idx].deadline {
                break;
            }
            self.swap_nodes(parent, idx);
            idx = parent;
        }
    }

    /// Returns whether the entry moved.
    fn sift_down(&mut self, idx: usize, n: usize) -> bool {
        let mut hole = idx;
        let mut child = 2 * hole + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[hole].deadline < self.heap[child].deadline {
                break;
            }
            self.swap_nodes(hole, child);
            hole = child;
            child = 2 * hole + 1;
        }
        hole > idx
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::sleep;

    impl TimerHeap {
        fn assert_consistent(&self) {
            assert_eq!(self.index.len(), self.heap.len());
            for (idx, entry) in self.heap.iter().enumerate() {
                assert_eq!(self.index[&entry.id], idx, "index out of sync for {}", entry.id);
                if idx > 0 {
                    let parent = (idx - 1) / 2;
                    assert!(
                        self.heap[parent].deadline <= entry.deadline,
                        "heap order violated at {idx}"
                    );
                }
            }
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, impl Fn(u64) -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let fired = Arc::clone(&fired);
            move |id: u64| -> Box<dyn FnOnce() + Send> {
                let fired = Arc::clone(&fired);
                Box::new(move || fired.lock().unwrap().push(id))
            }
        };
        (fired, make)
    }

    #[test]
    fn fires_in_deadline_order() {
        let (fired, cb) = recorder();
        let mut heap = TimerHeap::new();
        heap.add(1, Duration::from_millis(400), cb(1));
        heap.add(2, Duration::from_millis(200), cb(2));
        heap.add(3, Duration::from_millis(600), cb(3));
        heap.assert_consistent();

        sleep(Duration::from_millis(250));
        let wait = heap.next_tick();
        assert_eq!(*fired.lock().unwrap(), vec![2]);
        assert!((1..=200).contains(&wait), "wait was {wait}");

        sleep(Duration::from_millis(250));
        heap.next_tick();
        assert_eq!(*fired.lock().unwrap(), vec![2, 1]);

        sleep(Duration::from_millis(200));
        heap.next_tick();
        assert_eq!(*fired.lock().unwrap(), vec![2, 1, 3]);
        assert_eq!(heap.next_tick(), -1);
    }

    #[test]
    fn adjust_postpones_expiry() {
        let (fired, cb) = recorder();
        let mut heap = TimerHeap::new();
        heap.add(7, Duration::from_millis(30), cb(7));
        assert!(heap.adjust(7, Duration::from_millis(200)));
        sleep(Duration::from_millis(60));
        heap.tick();
        assert!(fired.lock().unwrap().is_empty());
        assert!(!heap.adjust(99, Duration::from_millis(10)));
    }

    #[test]
    fn re_add_replaces_deadline_and_callback() {
        let (fired, cb) = recorder();
        let mut heap = TimerHeap::new();
        heap.add(5, Duration::from_millis(10), cb(5));
        heap.add(5, Duration::from_millis(10), cb(55));
        assert_eq!(heap.len(), 1);
        sleep(Duration::from_millis(30));
        heap.tick();
        assert_eq!(*fired.lock().unwrap(), vec![55]);
    }

    #[test]
    fn remove_disarms_without_firing() {
        let (fired, cb) = recorder();
        let mut heap = TimerHeap::new();
        heap.add(1, Duration::from_millis(10), cb(1));
        heap.add(2, Duration::from_millis(20), cb(2));
        assert!(heap.remove(1));
        assert!(!heap.remove(1));
        heap.assert_consistent();
        sleep(Duration::from_millis(40));
        heap.tick();
        assert_eq!(*fired.lock().unwrap(), vec![2]);
    }

    #[test]
    fn tick_drains_every_expired_entry() {
        let (fired, cb) = recorder();
        let mut heap = TimerHeap::new();
        for id in 0..8 {
            heap.add(id, Duration::from_millis(5), cb(id));
        }
        sleep(Duration::from_millis(30));
        heap.tick();
        assert!(heap.is_empty());
        let mut seen = fired.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn index_stays_consistent_under_mixed_ops() {
        // Deterministic pseudo-random op sequence.
        let mut heap = TimerHeap::new();
        let mut state: u64 = 0x2545f491;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for _ in 0..500 {
            let id = next() % 32;
            match next() % 4 {
                0 | 1 => {
                    let ms = 50 + (next() % 1000);
                    heap.add(id, Duration::from_millis(ms), || {});
                }
                2 => {
                    heap.adjust(id, Duration::from_millis(50 + (next() % 500)));
                }
                _ => {
                    heap.remove(id);
                }
            }
            heap.assert_consistent();
        }
        let count = Arc::new(AtomicU64::new(0));
        while !heap.is_empty() {
            heap.pop();
            heap.assert_consistent();
            count.fetch_add(1, Ordering::Relaxed);
        }
    }
}
