//! Parallel-for decomposition
//!
//! Splits a range-based operation into a balanced binary tree of sibling
//! leaf jobs under one synthetic no-op root, so the whole operation can be
//! launched and awaited through a single handle.
//!
//! The split tree is built once and reused: every launch rewrites the
//! captured-arguments portion of each leaf's payload in place, which
//! amortizes the split and allocation cost across invocations of the same
//! operation (typical for per-frame workloads).

use crate::{
    arena::Lane,
    job::{self, JobRef},
    pool::Scheduler,
};
use std::{marker::PhantomData, mem::MaybeUninit};

/// Default maximum number of indices per leaf job
pub const DEFAULT_CHUNK: u32 = 256;

impl Scheduler {
    /// Prepare a parallel iteration of `body` over `[begin, end)`
    ///
    /// Uses the [`Lane::Temp`] allocator and the [`DEFAULT_CHUNK`] split
    /// granularity; see [`Scheduler::parallel_for_with()`] for control over
    /// both. The returned object is launched with
    /// [`run()`](ParallelFor::run) and awaited with
    /// [`wait()`](ParallelFor::wait).
    ///
    /// `body` receives the iteration index and a reference to the arguments
    /// passed to `run()`; it is cloned into every leaf job.
    pub fn parallel_for<F, A>(&self, body: F, begin: u32, end: u32) -> ParallelFor<'_, F, A>
    where
        F: Fn(u32, &A) + Clone + Send + 'static,
        A: Copy + Send + 'static,
    {
        self.parallel_for_with(Lane::Temp, body, begin, end, DEFAULT_CHUNK)
    }

    /// Prepare a parallel iteration with an explicit lane and chunk size
    ///
    /// A chunk size of 0 is treated as 1. Long-lived, recurring operations
    /// should use [`Lane::Static`] so that per-frame churn on the temp ring
    /// cannot wrap over their leaves.
    pub fn parallel_for_with<F, A>(
        &self,
        lane: Lane,
        body: F,
        begin: u32,
        end: u32,
        chunk: u32,
    ) -> ParallelFor<'_, F, A>
    where
        F: Fn(u32, &A) + Clone + Send + 'static,
        A: Copy + Send + 'static,
    {
        ParallelFor::new(self, lane, body, begin, end, chunk)
    }
}

/// A reusable parallel iteration: a no-op root job plus one leaf job per
/// index subrange
///
/// The same tree may be launched any number of times with different
/// arguments; `wait()` must be allowed to return between two `run()`s of
/// the same object, since relaunching resets jobs that must not be in
/// flight.
pub struct ParallelFor<'scheduler, F, A = ()> {
    /// Scheduler whose home participant owns all jobs of this tree
    scheduler: &'scheduler Scheduler,

    /// Allocator lane backing the root and leaves
    lane: Lane,

    /// Master copy of the iteration body, cloned into each leaf
    body: F,

    /// Maximum indices per leaf, at least 1
    chunk: u32,

    /// Synthetic root; completes once all leaves have
    root: JobRef,

    /// Leaf jobs, each covering one contiguous subrange
    leaves: Vec<JobRef>,

    /// The argument type only appears inside type-erased leaf payloads
    _args: PhantomData<fn(A)>,
}
//
impl<'scheduler, F, A> ParallelFor<'scheduler, F, A>
where
    F: Fn(u32, &A) + Clone + Send + 'static,
    A: Copy + Send + 'static,
{
    /// See [`Scheduler::parallel_for_with()`]
    fn new(
        scheduler: &'scheduler Scheduler,
        lane: Lane,
        body: F,
        begin: u32,
        end: u32,
        chunk: u32,
    ) -> Self {
        let root = scheduler.create_job_with(lane, (), job::noop);
        let mut result = Self {
            scheduler,
            lane,
            body,
            chunk: chunk.max(1),
            root,
            leaves: Vec::new(),
            _args: PhantomData,
        };
        result.rebuild_leaves(begin, end);
        result
    }

    /// Re-split the tree over a new index range
    ///
    /// Allocates fresh leaf jobs from the lane's ring; the previous leaves
    /// are abandoned to ring wraparound. Must not be called while a launch
    /// of this tree is in flight.
    pub fn set_range(&mut self, begin: u32, end: u32, chunk: u32) {
        self.chunk = chunk.max(1);
        self.rebuild_leaves(begin, end);
    }

    /// Rewrite the captured arguments of every leaf in place
    ///
    /// Must not be called while a launch of this tree is in flight.
    pub fn set_args(&mut self, args: A) {
        let shared = self.scheduler.shared();
        for &leaf in &self.leaves {
            // SAFETY: Each leaf stores a LeafTask<F, A> (written by
            //         rebuild_leaves), and per this method's contract the
            //         tree is idle, so nobody else is reading the payload
            unsafe {
                (*shared.job(leaf).payload_ptr::<LeafTask<F, A>>()).args = MaybeUninit::new(args);
            }
        }
    }

    /// Launch the whole tree with the given arguments
    ///
    /// Leaves may start (and finish) executing while later siblings are
    /// still being queued; completion of the whole operation is observed
    /// through [`wait()`](Self::wait). A previous launch of this tree must
    /// have been waited out first.
    pub fn run(&mut self, args: A) {
        self.arm(args);
        self.scheduler.launch(self.root);
    }

    /// Ready the tree and launch its leaves, but not the root
    ///
    /// The root's own pending unit of work keeps the operation incomplete
    /// until the root is launched, which makes the armed tree safe to fold
    /// into a [`JobGraph`](crate::JobGraph) via [`root()`](Self::root) and
    /// [`append_job()`](crate::JobGraph::append_job). A previous launch of
    /// this tree must have been waited out first.
    pub fn arm(&mut self, args: A) {
        self.set_args(args);
        let shared = self.scheduler.shared();
        let root = shared.job(self.root);
        // SAFETY: Per this method's contract the tree is idle, so resetting
        //         counters and parent links races with nothing
        unsafe {
            root.reset();
            for &leaf in &self.leaves {
                shared.job(leaf).reset_as_child(self.root, root);
            }
        }
        for &leaf in &self.leaves {
            self.scheduler.launch(leaf);
        }
    }

    /// Cooperatively wait until every leaf (and the root) has completed
    pub fn wait(&self) {
        self.scheduler.wait(self.root);
    }

    /// Root job handle, for folding this operation into a job graph
    pub fn root(&self) -> JobRef {
        self.root
    }

    /// Allocate one leaf job per subrange of `[begin, end)`
    fn rebuild_leaves(&mut self, begin: u32, end: u32) {
        let mut ranges = Vec::new();
        split_range(begin, end, self.chunk, &mut ranges);
        self.leaves.clear();
        for (begin, end) in ranges {
            let task = LeafTask {
                body: self.body.clone(),
                begin,
                end,
                args: MaybeUninit::<A>::uninit(),
            };
            self.leaves
                .push(self.scheduler.create_job_with(self.lane, task, run_leaf::<F, A>));
        }
    }
}

/// In-place payload of a parallel-for leaf job
///
/// Unlike a one-shot job's closure, this payload survives its invocation:
/// the same leaf is re-armed and re-launched by later `run()`s.
struct LeafTask<F, A> {
    /// This leaf's copy of the iteration body
    body: F,

    /// First index covered by this leaf
    begin: u32,

    /// One past the last index covered by this leaf
    end: u32,

    /// Iteration-invariant arguments, rewritten by each `run()`
    args: MaybeUninit<A>,
}

/// Trampoline of parallel-for leaf jobs
///
/// Runs the body over the leaf's subrange by reference, leaving the payload
/// in place for the next launch.
unsafe fn run_leaf<F: Fn(u32, &A), A>(payload: *mut u8) {
    // SAFETY: Leaves are always prepared with a LeafTask<F, A> payload, and
    //         the scheduling protocol makes us its only current accessor
    let task = unsafe { &*payload.cast::<LeafTask<F, A>>() };
    // SAFETY: run() writes the arguments before launching any leaf
    let args = unsafe { task.args.assume_init_ref() };
    for index in task.begin..task.end {
        (task.body)(index, args);
    }
}

/// Balanced binary split of `[begin, end)` into chunks of at most `chunk`
///
/// Recursion on the midpoint (left half rounds down), not a fixed-stride
/// walk, so sibling subtrees stay balanced for any range length. An empty
/// range yields no chunks at all.
fn split_range(begin: u32, end: u32, chunk: u32, out: &mut Vec<(u32, u32)>) {
    if begin >= end {
        return;
    }
    if end - begin <= chunk {
        out.push((begin, end));
        return;
    }
    let mid = begin + (end - begin) / 2;
    split_range(begin, mid, chunk, out);
    split_range(mid, end, chunk, out);
}
