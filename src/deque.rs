//! Per-participant work-stealing deque
//!
//! A bounded, lock-free double-ended queue of packed job handles. The owning
//! participant pushes and pops at the bottom end; any other thread may steal
//! from the top end. The owner never needs an atomic read-modify-write except
//! in the single-element race, because only the owner writes `bottom`;
//! stealers only ever move `top` forward via compare-and-swap, so concurrent
//! steals from multiple threads serialize safely against each other and
//! against the owner's pop.
//!
//! Elements are `Copy` words (packed [`JobRef`]s), so slots can be bare
//! atomics: the read of a slot that loses the subsequent `top` race is
//! well-defined and simply discarded, with no private-slot machinery needed.
//!
//! Losing a race is not an error. Both `steal()` and the last-element path
//! of `pop()` report it as an explicit no-job result that callers must treat
//! exactly like an empty queue: retry later or yield, never abort.

use crate::job::JobRef;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};

/// Bounded lock-free work-stealing deque of job handles
///
/// The valid entries at any instant are `[top, bottom)` modulo capacity; the
/// indices themselves increase monotonically and are reduced to slot
/// positions by bit masking. `bottom` and `top` live on separate cache lines
/// so that stealers hammering `top` do not invalidate the owner's line.
pub(crate) struct JobDeque {
    /// Owner end: written only by the owning participant
    bottom: CachePadded<AtomicI64>,

    /// Steal end: advanced by CAS from stealers, and by the owner when it
    /// wins the last-element race
    top: CachePadded<AtomicI64>,

    /// Packed job handles; a slot is only read while inside `[top, bottom)`
    slots: Box<[AtomicU64]>,

    /// `capacity - 1`, for index masking
    mask: i64,
}
//
impl JobDeque {
    /// Set up a deque for `capacity` jobs (rounded up to a power of two)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        let slots = std::iter::repeat_with(|| AtomicU64::new(0))
            .take(capacity)
            .collect();
        Self {
            bottom: CachePadded::new(AtomicI64::new(0)),
            top: CachePadded::new(AtomicI64::new(0)),
            slots,
            mask: (capacity - 1) as i64,
        }
    }

    /// Number of jobs the deque can hold
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot behind a monotonic index
    fn slot(&self, index: i64) -> &AtomicU64 {
        &self.slots[(index & self.mask) as usize]
    }

    /// Push a job on the owner end
    ///
    /// A full deque hands the job back instead of overwriting an entry that
    /// may still be observed by stealers.
    ///
    /// # Safety
    ///
    /// Only the owning participant may call this.
    pub unsafe fn push(&self, job: JobRef) -> Result<(), Full> {
        let b = self.bottom.load(Ordering::Relaxed);
        // Acquire pairs with the stealers' successful CAS: once we observe
        // their new `top`, their slot reads are over and the slot is ours to
        // overwrite.
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.capacity() as i64 {
            return Err(Full(job));
        }
        self.slot(b).store(job.into_raw(), Ordering::Relaxed);
        // Release publishes the slot write before the new `bottom`; a single
        // writer means no CAS is needed here.
        self.bottom.store(b + 1, Ordering::Release);
        Ok(())
    }

    /// Pop a job from the owner end
    ///
    /// Returns no job when the deque is empty or when a concurrent stealer
    /// won the race for the last element.
    ///
    /// # Safety
    ///
    /// Only the owning participant may call this.
    pub unsafe fn pop(&self) -> Option<JobRef> {
        // Optimistically claim the bottom element, then look at `top`. The
        // SeqCst fence orders our `bottom` write against the stealers'
        // `top` read: either a stealer sees the decremented `bottom` and
        // backs off, or we see its CAS on `top` below.
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t <= b {
            let raw = self.slot(b).load(Ordering::Relaxed);
            if t != b {
                // More than one element: stealers cannot reach index b
                return Some(JobRef::from_raw(raw));
            }
            // Last element: race concurrent stealers for it
            let job = if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                Some(JobRef::from_raw(raw))
            } else {
                // A stealer got there first; the element is theirs
                None
            };
            self.bottom.store(t + 1, Ordering::Relaxed);
            job
        } else {
            // Deque was already empty; restore the canonical empty state
            self.bottom.store(t, Ordering::Relaxed);
            None
        }
    }

    /// Steal a job from the top end
    ///
    /// May be called from any thread. A lost race ([`StealError::Lost`])
    /// must be handled exactly like [`StealError::Empty`].
    pub fn steal(&self) -> Result<JobRef, StealError> {
        // `top` must be read before `bottom`: the fence pairs with the one
        // in pop() so that an owner mid-pop is seen as such.
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        // Acquire pairs with the owner's Release publish in push(), making
        // the slot write below visible.
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return Err(StealError::Empty);
        }
        // Read the candidate before the CAS; if the CAS fails the value is
        // stale and simply discarded.
        let raw = self.slot(t).load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // Lost to another stealer or to the owner's last-element pop
            return Err(StealError::Lost);
        }
        Ok(JobRef::from_raw(raw))
    }
}

/// Error returned when pushing to a full deque
///
/// The job that could not be pushed is handed back for reuse.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct Full(pub JobRef);

/// Errors that can occur when stealing from a deque
///
/// Callers must treat both variants identically: as "no job right now".
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum StealError {
    /// There was no element to steal
    Empty,

    /// Lost the race for an element against another thread
    Lost,
}
