//! yawn — runtime core for a readiness-based HTTP server.
//!
//! This crate carries the infrastructure the server is built from: a
//! three-region byte buffer with scatter-read support, a bounded blocking
//! queue, a binary-heap deadline timer, a thin epoll wrapper, a fixed
//! worker pool, an asynchronous rotating log sink behind the `log` facade,
//! and the key/value configuration loader.
//!
//! Everything here is protocol-agnostic; HTTP lives in `yawn-http` and the
//! connection/server wiring in `yawn-server`.

pub mod buffer;
pub mod config;
pub mod logger;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod reactor;
pub mod timer;

/// Growable byte buffer with prependable/readable/writable regions.
pub use buffer::Buffer;
/// Line-oriented `key=value` configuration table.
pub use config::Config;
/// Asynchronous log sink implementing [`log::Log`].
pub use logger::AsyncLogger;
/// Fixed pool of worker threads over a bounded task queue.
pub use pool::WorkerPool;
/// Capacity-bounded MPMC blocking queue with close signaling.
pub use queue::BlockingQueue;
/// Ready-event storage filled by [`reactor::Epoller::wait`].
pub use reactor::EventList;
/// Thread-safe epoll handle.
pub use reactor::Epoller;
/// Min-heap of per-id deadlines with O(log n) adjustment.
pub use timer::TimerHeap;
