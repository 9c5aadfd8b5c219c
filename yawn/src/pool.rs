//! Fixed worker pool over a bounded task queue.
//!
//! Threads block in [`BlockingQueue::pop`] when idle; the queue's
//! close-and-drain semantics double as graceful shutdown. Tasks are plain
//! boxed closures — the server submits per-connection read and write steps.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::queue::BlockingQueue;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    queue: Arc<BlockingQueue<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers sharing a queue of at most `queue_capacity`
    /// pending tasks.
    pub fn new(threads: usize, queue_capacity: usize) -> Self {
        let threads = threads.max(1);
        let queue = Arc::new(BlockingQueue::<Task>::new(queue_capacity));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("yawn-worker-{i}"))
                .spawn(move || {
                    while let Some(task) = queue.pop() {
                        task();
                    }
                });
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => log::error!("Failed to spawn worker thread {i}: {e}"),
            }
        }
        WorkerPool { queue, workers }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a task, blocking while the queue is full. Returns `false`
    /// after shutdown.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(task))
    }

    /// Close the queue and join the workers; queued tasks drain first.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        self.queue.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
