//! Ad-hoc job batches awaited as one unit
//!
//! A [`JobGraph`] is a synthetic no-op root that closures and other job
//! trees can be attached to as they are created. Attached work starts
//! executing immediately; the graph exists only so that all of it can be
//! awaited through a single handle.

use crate::{
    arena::Lane,
    job::{self, JobRef},
    pool::Scheduler,
};

impl Scheduler {
    /// Open a job batch backed by the [`Lane::Temp`] allocator
    pub fn graph(&self) -> JobGraph<'_> {
        self.graph_in(Lane::Temp)
    }

    /// Open a job batch backed by an explicit allocator lane
    pub fn graph_in(&self, lane: Lane) -> JobGraph<'_> {
        let root = self.create_job_with(lane, (), job::noop);
        // SAFETY: Freshly allocated slot, nothing references it yet
        unsafe { self.shared().job(root).reset() };
        JobGraph {
            scheduler: self,
            lane,
            root,
            launched: false,
        }
    }
}

/// A batch of concurrently executing jobs sharing one completion handle
///
/// Work appended to the graph is launched right away rather than held back;
/// [`wait()`](Self::wait) returns once every appended job (and anything
/// those jobs' subtrees contain) has completed.
///
/// ```
/// let scheduler = spindle::Scheduler::new();
/// let done = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
/// let mut batch = scheduler.graph();
/// for _ in 0..4 {
///     let done = done.clone();
///     batch.append(move || {
///         done.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///     });
/// }
/// batch.launch();
/// batch.wait();
/// assert_eq!(done.load(std::sync::atomic::Ordering::Relaxed), 4);
/// ```
pub struct JobGraph<'scheduler> {
    /// Scheduler whose home participant owns this batch
    scheduler: &'scheduler Scheduler,

    /// Allocator lane that appended closures are drawn from
    lane: Lane,

    /// Synthetic root every appended job hangs off
    root: JobRef,

    /// Whether the root itself has been queued yet
    launched: bool,
}
//
impl JobGraph<'_> {
    /// Attach a closure to the batch and launch it immediately
    pub fn append<F: FnOnce() + Send + 'static>(&mut self, task: F) {
        let job = self.scheduler.create_job(self.lane, task);
        let shared = self.scheduler.shared();
        // SAFETY: Freshly allocated slot; the root cannot complete while its
        //         own launch is still pending, so attaching is race-free
        unsafe {
            shared
                .job(job)
                .reset_as_child(self.root, shared.job(self.root));
        }
        self.scheduler.launch(job);
    }

    /// Attach an already-built job tree (another batch's root, an armed
    /// parallel-for's root) so this batch also waits for its subtree, and
    /// launch its root
    ///
    /// The root itself must not have been launched yet; children hanging
    /// off it may already be running, since the root's pending unit of work
    /// holds the subtree incomplete until this call.
    pub fn append_job(&mut self, job: JobRef) {
        let shared = self.scheduler.shared();
        // SAFETY: Per this method's contract the root has not been launched
        unsafe {
            shared
                .job(job)
                .attach_to(self.root, shared.job(self.root));
        }
        self.scheduler.launch(job);
    }

    /// Queue the root itself, closing the batch for completion purposes
    ///
    /// Until this is called, the root's own pending unit of work keeps the
    /// completion counter above zero and `wait()` would not return.
    pub fn launch(&mut self) {
        self.scheduler.launch(self.root);
        self.launched = true;
    }

    /// Cooperatively wait until every appended job has completed
    ///
    /// A batch folded into another graph via
    /// [`append_job()`](Self::append_job) is awaited through that graph,
    /// not through this method.
    ///
    /// # Panics
    ///
    /// Panics if [`launch()`](Self::launch) has not been called: waiting on
    /// a root that was never queued would hang forever.
    pub fn wait(&self) {
        assert!(
            self.launched,
            "job graph awaited before its root was launched: \
             the batch can never complete"
        );
        self.scheduler.wait(self.root);
    }

    /// Root job handle, for nesting this batch under another graph
    pub fn root(&self) -> JobRef {
        self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn appended_jobs_all_complete() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(2);
        let runs: Arc<[AtomicU32]> = (0..32).map(|_| AtomicU32::new(0)).collect();
        let mut batch = scheduler.graph();
        for i in 0..32 {
            let runs = runs.clone();
            batch.append(move || {
                runs[i].fetch_add(1, Ordering::Relaxed);
            });
        }
        batch.launch();
        batch.wait();
        for (i, slot) in runs.iter().enumerate() {
            assert_eq!(slot.load(Ordering::Relaxed), 1, "job {i} ran a wrong number of times");
        }
    }

    /// Waiting before the root is queued is reported, not hung on
    #[test]
    #[should_panic(expected = "before its root was launched")]
    fn wait_before_launch_panics() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(0);
        let mut batch = scheduler.graph();
        batch.append(|| {});
        batch.wait();
    }

    /// A batch with nothing appended completes as soon as its root runs
    #[test]
    fn empty_batch_completes() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(1);
        let mut batch = scheduler.graph_in(Lane::Static);
        batch.launch();
        batch.wait();
        assert_eq!(scheduler.shared().job(batch.root()).unfinished(), 0);
    }

    /// Waiting on an outer batch also waits for a nested batch's subtree
    #[test]
    fn nested_batches_complete_together() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(2);
        let inner_runs = Arc::new(AtomicU32::new(0));
        let outer_runs = Arc::new(AtomicU32::new(0));

        let mut inner = scheduler.graph();
        for _ in 0..8 {
            let inner_runs = inner_runs.clone();
            inner.append(move || {
                inner_runs.fetch_add(1, Ordering::Relaxed);
            });
        }

        let mut outer = scheduler.graph();
        {
            let outer_runs = outer_runs.clone();
            outer.append(move || {
                outer_runs.fetch_add(1, Ordering::Relaxed);
            });
        }
        outer.append_job(inner.root());
        outer.launch();
        outer.wait();

        assert_eq!(inner_runs.load(Ordering::Relaxed), 8);
        assert_eq!(outer_runs.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler.shared().job(inner.root()).unfinished(), 0);
    }

    /// A parallel-for tree can be folded into a batch via its root handle
    #[test]
    fn parallel_for_folds_into_a_batch() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(2);
        let data: Arc<[AtomicU32]> = (0..256).map(|_| AtomicU32::new(0)).collect();
        let mut operation = scheduler.parallel_for(
            {
                let data = data.clone();
                move |i: u32, &(): &()| {
                    data[i as usize].fetch_add(1, Ordering::Relaxed);
                }
            },
            0,
            256,
        );
        operation.arm(());

        let mut batch = scheduler.graph();
        batch.append_job(operation.root());
        batch.launch();
        batch.wait();

        assert!(data.iter().all(|slot| slot.load(Ordering::Relaxed) == 1));
    }
}
