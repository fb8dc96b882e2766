//! Worker thread run loop and job execution

use crate::{job::JobRef, pool::Shared, YIELD_DURATION};

/// Worker thread main loop
///
/// Repeatedly pops from this worker's own deque or steals from a random
/// other participant; executes what it gets, yields its time slice when
/// there is nothing, and winds down once the run flag clears.
///
/// `me` is this thread's participant index, threaded through explicitly
/// rather than stashed in thread-local storage.
pub(crate) fn run(shared: &Shared, me: usize) {
    log::trace!("worker #{me} starting");
    while shared.is_running() {
        // SAFETY: `me` is this very thread's participant index
        match unsafe { shared.pop_or_steal(me) } {
            Some(job) => execute(shared, job),
            None => std::thread::sleep(YIELD_DURATION),
        }
    }
    log::trace!("worker #{me} stopping");
}

/// Execute one job: invoke its body, then record and propagate completion
///
/// Callers obtain `job` from a successful pop or steal, which is what makes
/// this the job's unique executor.
pub(crate) fn execute(shared: &Shared, job: JobRef) {
    let job = shared.job(job);
    // A panic escaping a job body would strand its ancestors' completion
    // counters and deadlock every waiter, and there is no error channel out
    // of a job, so unwinding translates to an abort.
    let abort_on_unwind = AbortOnUnwind;
    // SAFETY: Exactly one pop or steal returns each launched handle, so we
    //         are the single executor of this job for this reset
    unsafe {
        job.invoke();
        job.finish(shared);
    }
    std::mem::forget(abort_on_unwind);
}

/// Aborts if dropped, used to translate panics to aborts
struct AbortOnUnwind;
//
impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        std::process::abort()
    }
}
