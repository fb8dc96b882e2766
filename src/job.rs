//! Cache-line-sized job descriptor
//!
//! A [`Job`] is the unit of scheduling: a type-erasure trampoline, an
//! optional back-reference to a parent job, an atomic completion counter, and
//! an in-place payload buffer for the closure being run. The four together
//! fill exactly one cache line, so a ring of jobs never shares a line between
//! two slots and enqueuing a job moves a single pointer-sized handle.
//!
//! # Safety
//!
//! Jobs are shared between threads through [`JobRef`] handles and a protocol,
//! not through Rust ownership:
//!
//! - The creating thread writes the payload, trampoline and counter fields
//!   *before* publishing the handle to a work queue. The queue's Release
//!   publish / Acquire steal pair makes those plain writes visible to
//!   whichever thread executes the job.
//! - Exactly one thread obtains the handle (by pop or steal) and calls
//!   [`Job::invoke()`] then [`Job::finish()`]; nobody else touches the
//!   non-atomic fields while the job is in flight.
//! - A slot may be reused (by ring-allocator wraparound) only once the job
//!   stored there has finished. Violating this is the allocator's documented
//!   caller contract, not something detected here.

use crate::arena::Lane;
use crate::pool::Shared;
use std::{
    cell::UnsafeCell,
    mem,
    mem::MaybeUninit,
    num::NonZeroU64,
    sync::atomic::{self, AtomicU32, Ordering},
};

/// Assumed cache line size, and therefore the exact size of a [`Job`]
pub(crate) const CACHE_LINE: usize = 64;

/// Type-erased entry point stored in a job
///
/// Receives a pointer to the job's payload buffer and runs the closure that
/// was constructed there.
pub(crate) type Trampoline = unsafe fn(*mut u8);

/// Bytes of in-place closure storage in a [`Job`]
///
/// Sized so that the payload plus the job header (trampoline, parent handle,
/// completion counter and its trailing padding up to pointer alignment) fill
/// exactly one cache line.
pub(crate) const PAYLOAD_BYTES: usize = CACHE_LINE
    - mem::size_of::<Trampoline>()
    - mem::size_of::<Option<JobRef>>()
    - 2 * mem::size_of::<u32>();

/// Fixed-size schedulable unit of work
///
/// The payload buffer comes first so that it inherits the struct's cache-line
/// alignment: closures aligned up to [`CACHE_LINE`] can be constructed in
/// place without any offset arithmetic.
#[repr(C, align(64))]
pub(crate) struct Job {
    /// In-place storage for the closure run by `invoke`
    payload: UnsafeCell<[MaybeUninit<u8>; PAYLOAD_BYTES]>,

    /// Trampoline that runs the payload
    invoke: UnsafeCell<Trampoline>,

    /// Non-owning back-reference to the parent job, if any
    ///
    /// Used only for completion propagation; jobs are never freed through
    /// this handle (slot lifetime is governed by the ring allocator).
    parent: UnsafeCell<Option<JobRef>>,

    /// Number of unfinished jobs in this subtree, including this job itself
    ///
    /// Initialized to 1 by `reset()`, incremented once per attached child,
    /// decremented exactly once per completed job.
    unfinished: AtomicU32,
}
//
const _: () = assert!(mem::size_of::<Job>() == CACHE_LINE);
const _: () = assert!(mem::align_of::<Job>() == CACHE_LINE);
//
impl Job {
    /// Set up an idle slot (no-op trampoline, no parent, nothing in flight)
    pub fn idle() -> Self {
        Self {
            payload: UnsafeCell::new([MaybeUninit::uninit(); PAYLOAD_BYTES]),
            invoke: UnsafeCell::new(noop as Trampoline),
            parent: UnsafeCell::new(None),
            unfinished: AtomicU32::new(0),
        }
    }

    /// Store a one-shot closure, to be consumed and dropped by `invoke()`
    ///
    /// A closure whose captures do not fit [`PAYLOAD_BYTES`] fails to
    /// compile: the size check is a post-monomorphization constant
    /// assertion, never a runtime branch.
    ///
    /// # Safety
    ///
    /// The slot must not be in flight (enqueued but not yet finished).
    pub unsafe fn prepare<F: FnOnce() + Send>(&self, task: F) {
        // SAFETY: Per this method's precondition
        unsafe { self.prepare_with(task, run_once::<F>) };
    }

    /// Store an arbitrary payload together with the trampoline that runs it
    ///
    /// Used for payloads that outlive a single invocation, like parallel-for
    /// leaf tasks: the trampoline decides whether the payload is consumed.
    ///
    /// # Safety
    ///
    /// The slot must not be in flight, and `invoke` must treat the payload
    /// bytes as a valid `T`.
    pub unsafe fn prepare_with<T: Send>(&self, payload: T, invoke: Trampoline) {
        const {
            assert!(
                mem::size_of::<T>() <= PAYLOAD_BYTES,
                "job payload does not fit the in-place storage of a Job"
            );
            assert!(
                mem::align_of::<T>() <= CACHE_LINE,
                "job payload is over-aligned for the in-place storage of a Job"
            );
        }
        // SAFETY: The payload buffer is cache-line-aligned, the constant
        //         assertions above bound T's size and alignment, and per the
        //         precondition no other thread is accessing this slot.
        unsafe {
            self.payload.get().cast::<T>().write(payload);
            *self.invoke.get() = invoke;
        }
    }

    /// Typed pointer to the payload buffer
    ///
    /// # Safety
    ///
    /// The slot must currently hold a payload of type `T`, and the caller
    /// must not touch it while the job is in flight.
    pub unsafe fn payload_ptr<T>(&self) -> *mut T {
        self.payload.get().cast::<T>()
    }

    /// Make this a root/independent job: no parent, counter back to 1
    ///
    /// # Safety
    ///
    /// The slot must not be in flight.
    pub unsafe fn reset(&self) {
        // SAFETY: Per this method's precondition
        unsafe { *self.parent.get() = None };
        self.unfinished.store(1, Ordering::Relaxed);
    }

    /// Attach this job as a child of `parent`
    ///
    /// Bumps the parent's completion counter so that the parent only
    /// completes once this child (and all previously attached siblings) has
    /// finished.
    ///
    /// # Safety
    ///
    /// The slot must not be in flight, and `parent_ref` must designate
    /// `parent`.
    pub unsafe fn reset_as_child(&self, parent_ref: JobRef, parent: &Job) {
        // SAFETY: Per this method's precondition
        unsafe { *self.parent.get() = Some(parent_ref) };
        self.unfinished.store(1, Ordering::Relaxed);
        // Plain increment: attachment happens before the child is published,
        // so the counter is in place before anyone could decrement it.
        parent.unfinished.fetch_add(1, Ordering::Relaxed);
    }

    /// Hang this job (and therefore its whole subtree) under `parent`
    ///
    /// Unlike [`reset_as_child()`](Self::reset_as_child) this leaves the
    /// job's own counter alone, so a root that already has children
    /// attached keeps accounting for them.
    ///
    /// # Safety
    ///
    /// This job must not have been launched yet, and `parent_ref` must
    /// designate `parent`.
    pub unsafe fn attach_to(&self, parent_ref: JobRef, parent: &Job) {
        // SAFETY: Per this method's precondition; the write is published by
        //         the job's own subsequent launch
        unsafe { *self.parent.get() = Some(parent_ref) };
        parent.unfinished.fetch_add(1, Ordering::Relaxed);
    }

    /// Run the stored closure
    ///
    /// # Safety
    ///
    /// Must be called exactly once per reset, by the single thread that
    /// popped or stole this job's handle.
    pub unsafe fn invoke(&self) {
        // SAFETY: The trampoline and payload were written before the handle
        //         was published, and per the precondition we are the only
        //         thread touching this slot.
        unsafe { (*self.invoke.get())(self.payload.get().cast()) };
    }

    /// Record completion of this job's own work and propagate upward
    ///
    /// Decrements the counter; on reaching zero the job is complete, which
    /// counts as finishing one unit of its parent's work, and so on up the
    /// tree. Propagation is iterative, so arbitrarily deep trees cannot
    /// overflow the stack.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per reset, after `invoke()`, by the
    /// executing thread. `shared` must be the state this job's parent handle
    /// resolves against.
    pub unsafe fn finish(&self, shared: &Shared) {
        let mut job = self;
        loop {
            // Release so that our writes happen-before whoever observes the
            // zero; Acquire fence below so the completing thread observes all
            // children's writes. Same protocol as dropping the last Arc.
            if job.unfinished.fetch_sub(1, Ordering::Release) != 1 {
                return;
            }
            atomic::fence(Ordering::Acquire);
            // SAFETY: The parent handle was written before this job was
            //         published and no longer changes; resolving it is valid
            //         per this method's precondition.
            match unsafe { *job.parent.get() } {
                Some(parent) => job = shared.job(parent),
                None => return,
            }
        }
    }

    /// Current completion counter, 0 once the whole subtree is done
    pub fn unfinished(&self) -> u32 {
        self.unfinished.load(Ordering::Acquire)
    }
}
//
// SAFETY: All fields are either atomic or governed by the publish/execute
//         protocol described in the module docs; the unsafe methods that
//         touch the UnsafeCell fields spell out who may call them when.
unsafe impl Sync for Job {}
//
// SAFETY: Payloads are constrained to be Send at the prepare() boundary
unsafe impl Send for Job {}

/// Trampoline of idle slots and of synthetic root jobs
pub(crate) unsafe fn noop(_payload: *mut u8) {}

/// Trampoline for one-shot closures stored by [`Job::prepare()`]
unsafe fn run_once<F: FnOnce() + Send>(payload: *mut u8) {
    // SAFETY: prepare() stored an F at this address, and the scheduling
    //         protocol guarantees a single invocation, so moving the closure
    //         out cannot double-drop. Captures are destroyed when `task`
    //         goes out of scope, which matters because the slot is recycled
    //         by ring wraparound rather than dropped.
    let task = unsafe { payload.cast::<F>().read() };
    task();
}

/// Packed handle to a [`Job`] slot
///
/// Identifies a job by allocator lane, owning participant and ring slot, so
/// that lifetime is governed by the ring's wraparound rather than by
/// reference counting. The packed form is a `NonZeroU64`, which keeps
/// `Option<JobRef>` pointer-sized and lets work queues store handles as bare
/// atomic words.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct JobRef(NonZeroU64);
//
impl JobRef {
    /// Tag bit guaranteeing that packed handles are never zero
    const TAG: u64 = 1 << 63;

    /// Bit offset of the allocator lane
    const LANE_SHIFT: u32 = 48;

    /// Bit offset of the owning participant index
    const PARTICIPANT_SHIFT: u32 = 32;

    /// Pack a handle
    pub(crate) fn new(lane: Lane, participant: usize, slot: u32) -> Self {
        debug_assert!(participant <= u16::MAX as usize);
        let raw = Self::TAG
            | ((lane as u64) << Self::LANE_SHIFT)
            | ((participant as u64) << Self::PARTICIPANT_SHIFT)
            | u64::from(slot);
        Self(NonZeroU64::new(raw).expect("tag bit guarantees a nonzero packed handle"))
    }

    /// Allocator lane this handle resolves through
    pub(crate) fn lane(self) -> Lane {
        if (self.0.get() >> Self::LANE_SHIFT) & 1 == 0 {
            Lane::Temp
        } else {
            Lane::Static
        }
    }

    /// Index of the participant whose ring holds the job
    pub(crate) fn participant(self) -> usize {
        ((self.0.get() >> Self::PARTICIPANT_SHIFT) & u64::from(u16::MAX)) as usize
    }

    /// Ring slot index within the participant's lane
    pub(crate) fn slot(self) -> u32 {
        (self.0.get() & u64::from(u32::MAX)) as u32
    }

    /// Packed word, for storage in a work queue
    pub(crate) fn into_raw(self) -> u64 {
        self.0.get()
    }

    /// Rebuild a handle from its packed word
    pub(crate) fn from_raw(raw: u64) -> Self {
        debug_assert!(raw & Self::TAG != 0);
        Self(NonZeroU64::new(raw).expect("work queues only store packed job handles"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<Job>(), CACHE_LINE);
        assert_eq!(mem::align_of::<Job>(), CACHE_LINE);
        assert_eq!(mem::size_of::<Option<JobRef>>(), mem::size_of::<JobRef>());
        // The header must leave room for a closure with a couple of captures
        assert!(PAYLOAD_BYTES >= 32);
    }

    #[test]
    fn handle_round_trip() {
        for (lane, participant, slot) in [
            (Lane::Temp, 0, 0),
            (Lane::Static, 3, 1023),
            (Lane::Temp, u16::MAX as usize, u32::MAX),
        ] {
            let handle = JobRef::new(lane, participant, slot);
            assert_eq!(handle.lane(), lane);
            assert_eq!(handle.participant(), participant);
            assert_eq!(handle.slot(), slot);
            assert_eq!(JobRef::from_raw(handle.into_raw()), handle);
        }
    }

    #[test]
    fn one_shot_runs_and_drops_captures() {
        let job = Job::idle();
        let ran = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(());
        {
            let ran = ran.clone();
            let captured = captured.clone();
            // SAFETY: Slot is idle and never published to another thread
            unsafe {
                job.prepare(move || {
                    let _keep_alive = &captured;
                    ran.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        assert_eq!(Arc::strong_count(&captured), 2);
        // SAFETY: Single invocation on the thread that prepared the job
        unsafe { job.invoke() };
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(Arc::strong_count(&captured), 1, "captures must be dropped");
    }

    #[test]
    fn reset_counters() {
        let parent = Job::idle();
        let child_a = Job::idle();
        let child_b = Job::idle();
        // SAFETY: Nothing is in flight, all jobs live on this stack frame
        unsafe {
            parent.reset();
            assert_eq!(parent.unfinished(), 1);
            let parent_ref = JobRef::new(Lane::Temp, 0, 0);
            child_a.reset_as_child(parent_ref, &parent);
            child_b.reset_as_child(parent_ref, &parent);
        }
        assert_eq!(parent.unfinished(), 3);
        assert_eq!(child_a.unfinished(), 1);
        assert_eq!(child_b.unfinished(), 1);
    }
}
