//! Fork-join job scheduling over per-worker lock-free work-stealing deques
//!
//! Callers submit small units of work ("jobs"), optionally organized into
//! dependency trees, and the scheduler executes them across a fixed pool of
//! worker threads. Each participant (worker thread or the thread owning the
//! [`Scheduler`] handle) has a double-ended work queue: the owner pushes and
//! pops on one end, everyone else may steal from the other end through a
//! single compare-and-swap. Waiting on a job is cooperative: the waiting
//! thread executes other available jobs instead of blocking on a kernel
//! primitive.
//!
//! Jobs are fixed-size, cache-line-sized descriptors with in-place storage
//! for their closure, handed out by per-participant ring allocators. There is
//! no heap allocation per job, and a closure too large for the in-place
//! buffer is rejected at build time rather than at runtime.
//!
//! ```
//! use spindle::Scheduler;
//! use std::sync::{
//!     atomic::{AtomicU32, Ordering},
//!     Arc,
//! };
//!
//! let scheduler = Scheduler::new();
//! let data: Arc<[AtomicU32]> = (0..1024).map(AtomicU32::new).collect();
//!
//! // Multiply every element of `data` by a factor, spread across the pool
//! let body = {
//!     let data = data.clone();
//!     move |i: u32, factor: &u32| {
//!         let slot = &data[i as usize];
//!         slot.store(slot.load(Ordering::Relaxed) * factor, Ordering::Relaxed);
//!     }
//! };
//! let mut multiply = scheduler.parallel_for(body, 0, 1024);
//! multiply.run(5);
//! multiply.wait();
//! assert!(data
//!     .iter()
//!     .enumerate()
//!     .all(|(i, v)| v.load(Ordering::Relaxed) == i as u32 * 5));
//! ```

#![warn(clippy::print_stdout, clippy::print_stderr, clippy::dbg_macro)]

mod arena;
mod deque;
mod graph;
mod job;
mod parallel;
mod pool;
mod worker;

pub use crate::{
    arena::Lane,
    graph::JobGraph,
    job::JobRef,
    parallel::{ParallelFor, DEFAULT_CHUNK},
    pool::Scheduler,
};

use std::time::Duration;

/// Sleep duration used when no job could be popped or stolen
///
/// A zero-duration sleep is a no-op on Linux, so the shortest nonzero one is
/// what actually cedes the time slice. This is a cooperative yield, not a
/// low-power wait: threads with nothing to do stay ready to pick fresh jobs
/// back up with minimal latency.
const YIELD_DURATION: Duration = Duration::from_nanos(1);

#[cfg(test)]
mod tests {
    /// Set up logging for tests that exercise the scheduler runtime
    pub(crate) fn setup_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
