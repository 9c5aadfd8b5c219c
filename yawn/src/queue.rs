//! Capacity-bounded blocking queue.
//!
//! One queue type serves both hot paths that need backpressure: the worker
//! pool's task queue and the log sink's message queue. Producers block while
//! the queue is full, consumers while it is empty. `close()` wakes every
//! waiter; afterwards `push` refuses new items while `pop` keeps returning
//! queued items until the queue drains, then yields `None`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> BlockingQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        BlockingQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until there is room, then enqueue. Returns `false` if the
    /// queue was closed before the item could be enqueued.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.lock();
        while !inner.closed && inner.items.len() >= inner.capacity {
            inner = self.not_full.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
        if inner.closed {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Block until an item is available or the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        while !inner.closed && inner.items.is_empty() {
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        match inner.items.pop_front() {
            Some(item) => {
                drop(inner);
                self.not_full.notify_one();
                Some(item)
            }
            None => None,
        }
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = BlockingQueue::new(8);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn push_blocks_until_pop() {
        let q = Arc::new(BlockingQueue::new(1));
        assert!(q.push(0u32));

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(1))
        };
        // Give the producer time to hit the full queue.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len(), 1);

        assert_eq!(q.pop(), Some(0));
        assert!(producer.join().unwrap());
        assert_eq!(q.pop(), Some(1));
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(BlockingQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(q.push(7u32));
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn close_drains_then_ends() {
        let q = BlockingQueue::new(8);
        assert!(q.push("a"));
        assert!(q.push("b"));
        q.close();
        q.close(); // idempotent

        assert!(!q.push("c"));
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        assert_eq!(q.pop(), None);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q = Arc::new(BlockingQueue::<u32>::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn close_wakes_blocked_producer() {
        let q = Arc::new(BlockingQueue::new(1));
        assert!(q.push(0u32));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(1))
        };
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(!producer.join().unwrap());
    }
}
