//! Scheduler runtime
//!
//! The runtime owns one work-stealing deque and two ring allocators per
//! participant. Participants are the `W` spawned worker threads plus the
//! thread holding the [`Scheduler`] handle (the "home" participant, index
//! `W`), which takes part in scheduling whenever it waits on a job.
//!
//! All progress is made by whichever thread next successfully pops or steals
//! a job; no mutex or condition variable ever guards dispatch. The only
//! blocking points are thread creation and join at startup/shutdown.

use crate::{
    arena::{JobArena, Lane, RING_CAPACITY},
    deque::{Full, JobDeque, StealError},
    job::{Job, JobRef, Trampoline},
    worker, YIELD_DURATION,
};
use rand::Rng;
use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// State shared by every participant of a scheduler
pub(crate) struct Shared {
    /// Per-participant deques and allocators; the last entry is the home
    /// participant, whose deque is the one all launched jobs land in
    participants: Box<[Participant]>,

    /// Global run flag, cleared on shutdown
    running: AtomicBool,
}
//
impl Shared {
    /// Set up shared state for `num_participants` participants
    fn new(num_participants: usize) -> Self {
        let participants = std::iter::repeat_with(Participant::new)
            .take(num_participants)
            .collect();
        Self {
            participants,
            running: AtomicBool::new(true),
        }
    }

    /// Resolve a job handle into its slot
    pub fn job(&self, job: JobRef) -> &Job {
        self.participants[job.participant()]
            .arena(job.lane())
            .job(job.slot())
    }

    /// Truth that workers should keep running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Next job for participant `me`: own deque first, then one steal
    /// attempt against a victim picked uniformly at random
    ///
    /// Returns no job when everything is empty or a race was lost; the
    /// caller should yield its time slice before retrying rather than spin.
    ///
    /// # Safety
    ///
    /// `me` must be the calling thread's own participant index.
    pub unsafe fn pop_or_steal(&self, me: usize) -> Option<JobRef> {
        // Own deque first: cache-friendly and contention-free
        // SAFETY: Per this method's precondition we are the owner
        if let Some(job) = unsafe { self.participants[me].queue.pop() } {
            return Some(job);
        }
        // Uniform pick over all participants; a self-pick is discarded
        // rather than re-rolled
        let victim = rand::thread_rng().gen_range(0..self.participants.len());
        if victim == me {
            return None;
        }
        match self.participants[victim].queue.steal() {
            Ok(job) => Some(job),
            // A lost race is handled exactly like an empty victim
            Err(StealError::Empty | StealError::Lost) => None,
        }
    }
}

/// Per-participant scheduling state
pub(crate) struct Participant {
    /// Work-stealing deque owned by this participant
    pub queue: JobDeque,

    /// Ring allocators, indexed by [`Lane`]
    arenas: [JobArena; 2],
}
//
impl Participant {
    fn new() -> Self {
        Self {
            // Sized so that every live job from both lanes fits at once:
            // a launch can then only fail if the allocator contract was
            // already violated
            queue: JobDeque::new(2 * RING_CAPACITY),
            arenas: [JobArena::new(RING_CAPACITY), JobArena::new(RING_CAPACITY)],
        }
    }

    /// Ring allocator behind an allocator lane
    pub fn arena(&self, lane: Lane) -> &JobArena {
        &self.arenas[lane as usize]
    }
}

/// Handle to a running scheduler, and its owner's scheduling identity
///
/// Construction spawns the worker pool; dropping the handle shuts it down
/// (clears the run flag and joins every worker). Callers must drain
/// in-flight work through the various `wait()`s before dropping.
///
/// The handle is deliberately neither `Sync` nor `Clone`: it embodies the
/// home participant's exclusive right to allocate jobs and push work, which
/// is what lets those paths go without synchronization.
pub struct Scheduler {
    /// State shared with the worker threads
    shared: Arc<Shared>,

    /// Worker thread handles, joined on drop
    workers: Vec<JoinHandle<()>>,

    /// Home participant index (== number of workers)
    home: usize,

    /// Make this type !Sync: it is an owner capability, not shared state
    _single_owner: PhantomData<Cell<u8>>,
}
//
impl Scheduler {
    /// Start a scheduler with one worker per CPU, minus one for the thread
    /// that drives it
    pub fn new() -> Self {
        let num_workers =
            std::thread::available_parallelism().map_or(1, |n| n.get().saturating_sub(1));
        Self::with_workers(num_workers)
    }

    /// Start a scheduler with an explicit worker count
    ///
    /// `num_workers` may be 0, in which case all progress is made by the
    /// handle-owning thread inside `wait()`.
    pub fn with_workers(num_workers: usize) -> Self {
        let shared = Arc::new(Shared::new(num_workers + 1));
        let mut workers = Vec::with_capacity(num_workers);
        for worker_idx in 0..num_workers {
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("spindle worker #{worker_idx}"))
                    .spawn(move || worker::run(&shared, worker_idx))
                    .expect("failed to spawn worker thread"),
            );
        }
        log::info!("scheduler started with {num_workers} worker thread(s)");
        Self {
            shared,
            workers,
            home: num_workers,
            _single_owner: PhantomData,
        }
    }

    /// Number of worker threads backing this scheduler
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Shared state, for handle resolution by the job-building surfaces
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Allocate a job running a one-shot closure
    ///
    /// The counter and parent link are untouched; callers follow up with
    /// `reset()` or `reset_as_child()` before launching.
    pub(crate) fn create_job<F: FnOnce() + Send + 'static>(&self, lane: Lane, task: F) -> JobRef {
        let arena = self.shared.participants[self.home].arena(lane);
        // SAFETY: The !Sync scheduler handle makes its holder the home
        //         participant's single owner
        let slot = unsafe { arena.allocate() };
        // SAFETY: A freshly handed-out slot is not in flight as long as the
        //         caller upholds the ring wraparound contract
        unsafe { arena.job(slot).prepare(task) };
        JobRef::new(lane, self.home, slot)
    }

    /// Allocate a job with an explicit payload and trampoline
    pub(crate) fn create_job_with<T: Send>(
        &self,
        lane: Lane,
        payload: T,
        invoke: Trampoline,
    ) -> JobRef {
        let arena = self.shared.participants[self.home].arena(lane);
        // SAFETY: The !Sync scheduler handle makes its holder the home
        //         participant's single owner
        let slot = unsafe { arena.allocate() };
        // SAFETY: A freshly handed-out slot is not in flight as long as the
        //         caller upholds the ring wraparound contract
        unsafe { arena.job(slot).prepare_with(payload, invoke) };
        JobRef::new(lane, self.home, slot)
    }

    /// Queue a job so that every participant can pop or steal it
    ///
    /// # Panics
    ///
    /// Panics if the home deque is full, which can only happen once the ring
    /// allocators' live-job contract has been violated; jobs are never
    /// silently dropped.
    pub(crate) fn launch(&self, job: JobRef) {
        let queue = &self.shared.participants[self.home].queue;
        // SAFETY: The !Sync scheduler handle makes its holder the home
        //         participant's single owner
        if let Err(Full(_)) = unsafe { queue.push(job) } {
            panic!(
                "work queue full ({} jobs in flight): \
                 the ring allocators' live-job capacity has been exceeded",
                queue.capacity()
            );
        }
    }

    /// Cooperatively wait for a job's whole subtree to complete
    ///
    /// Instead of blocking, the calling thread executes other available
    /// jobs (popped from its own deque or stolen from a worker), so nested
    /// waits keep the pool making progress.
    pub(crate) fn wait(&self, job: JobRef) {
        let job = self.shared.job(job);
        while job.unfinished() > 0 {
            // SAFETY: `home` is this handle's own participant index, and
            //         the !Sync handle pins its use to one thread at a time
            match unsafe { self.shared.pop_or_steal(self.home) } {
                Some(next) => worker::execute(&self.shared, next),
                None => std::thread::sleep(YIELD_DURATION),
            }
        }
    }
}
//
impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
//
impl Drop for Scheduler {
    fn drop(&mut self) {
        // Release pairs with the workers' Acquire poll of the flag, so all
        // previously published work is visible before they wind down
        self.shared.running.store(false, Ordering::Release);
        for worker in self.workers.drain(..) {
            worker.join().expect("worker thread panicked");
        }
        log::debug!("scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn lifecycle() {
        crate::tests::setup_logger();
        Scheduler::new();
        Scheduler::with_workers(0);
        let scheduler = Scheduler::with_workers(2);
        assert_eq!(scheduler.worker_count(), 2);
    }

    #[test]
    fn single_job_runs() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(2);
        let ran = Arc::new(AtomicU32::new(0));
        let job = scheduler.create_job(Lane::Temp, {
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, Ordering::Relaxed);
            }
        });
        // SAFETY: Freshly created job, not yet launched
        unsafe { scheduler.shared().job(job).reset() };
        scheduler.launch(job);
        scheduler.wait(job);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler.shared().job(job).unfinished(), 0);
    }

    /// With zero workers, wait() is the only source of progress
    #[test]
    fn cooperative_wait_drains_without_workers() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(0);
        let ran = Arc::new(AtomicU32::new(0));
        let mut jobs = Vec::new();
        for _ in 0..10 {
            let job = scheduler.create_job(Lane::Temp, {
                let ran = ran.clone();
                move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                }
            });
            // SAFETY: Freshly created job, not yet launched
            unsafe { scheduler.shared().job(job).reset() };
            scheduler.launch(job);
            jobs.push(job);
        }
        for job in jobs {
            scheduler.wait(job);
        }
        assert_eq!(ran.load(Ordering::Relaxed), 10);
    }

    /// Independent jobs drained via any mix of pop/steal each run once
    #[test]
    fn no_double_invoke() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(3);
        const NUM_JOBS: usize = 500;
        let runs: Arc<[AtomicU32]> = (0..NUM_JOBS).map(|_| AtomicU32::new(0)).collect();
        let mut jobs = Vec::new();
        for i in 0..NUM_JOBS {
            let job = scheduler.create_job(Lane::Temp, {
                let runs = runs.clone();
                move || {
                    runs[i].fetch_add(1, Ordering::Relaxed);
                }
            });
            // SAFETY: Freshly created job, not yet launched
            unsafe { scheduler.shared().job(job).reset() };
            scheduler.launch(job);
            jobs.push(job);
        }
        for job in jobs {
            scheduler.wait(job);
        }
        for (i, slot) in runs.iter().enumerate() {
            assert_eq!(slot.load(Ordering::Relaxed), 1, "job {i} ran a wrong number of times");
        }
    }

    /// Root -> 2 children -> 2 grandchildren each: completing the leaves
    /// must drive every counter to zero, and each body runs exactly once
    #[test]
    fn three_level_tree_propagation() {
        crate::tests::setup_logger();
        let scheduler = Scheduler::with_workers(2);
        let shared = scheduler.shared();
        let runs: Arc<[AtomicU32]> = (0..7).map(|_| AtomicU32::new(0)).collect();
        let job = |i: usize| {
            scheduler.create_job(Lane::Temp, {
                let runs = runs.clone();
                move || {
                    runs[i].fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let root = job(0);
        let children = [job(1), job(2)];
        let grandchildren = [job(3), job(4), job(5), job(6)];
        // SAFETY: All jobs freshly created, nothing launched yet
        unsafe {
            shared.job(root).reset();
            for &child in &children {
                shared.job(child).reset_as_child(root, shared.job(root));
            }
            for (i, &grandchild) in grandchildren.iter().enumerate() {
                let parent = children[i / 2];
                shared
                    .job(grandchild)
                    .reset_as_child(parent, shared.job(parent));
            }
        }
        assert_eq!(shared.job(root).unfinished(), 3);

        scheduler.launch(root);
        for &child in &children {
            scheduler.launch(child);
        }
        for &grandchild in &grandchildren {
            scheduler.launch(grandchild);
        }
        scheduler.wait(root);

        for job in [root].iter().chain(&children).chain(&grandchildren) {
            assert_eq!(shared.job(*job).unfinished(), 0);
        }
        for (i, slot) in runs.iter().enumerate() {
            assert_eq!(slot.load(Ordering::Relaxed), 1, "job {i} ran a wrong number of times");
        }
    }
}
