//! Per-participant ring allocators for job slots
//!
//! Jobs are never allocated on the heap or freed individually: each
//! participant owns two fixed-capacity rings of [`Job`] slots and hands them
//! out by advancing a wrapping cursor. A slot is implicitly reclaimed when
//! the cursor wraps back around to it.
//!
//! This makes allocation a single addition, but moves a responsibility onto
//! the caller: the number of concurrently-live jobs drawn from one ring must
//! never exceed the ring's capacity, otherwise a job still in flight is
//! silently overwritten. That contract is not checked at runtime.

use crate::job::Job;
use std::cell::UnsafeCell;

/// Job slots per ring
///
/// Power of two so the wrapping cursor reduces to a bit mask.
pub(crate) const RING_CAPACITY: usize = 1024;

/// Selects which of a participant's two rings backs a given job
///
/// The frame loop of a host application would typically draw per-frame work
/// from [`Lane::Temp`], whose slots are recycled every frame or batch, and
/// longer-lived recurring jobs (like a reusable parallel-for tree) from
/// [`Lane::Static`], so that churn on temporary jobs cannot wrap over them.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Lane {
    /// Short-lived jobs, recycled every frame/batch
    Temp = 0,

    /// Longer-lived recurring jobs
    Static = 1,
}

/// Fixed-capacity ring of job slots with a wrapping allocation cursor
///
/// The ring itself is shared (any thread resolves handles into it and
/// executes the jobs inside), but the cursor is owner-only: a participant
/// allocates exclusively from its own rings, so allocation needs no
/// synchronization at all.
pub(crate) struct JobArena {
    /// Slot storage, length [`RING_CAPACITY`]
    slots: Box<[Job]>,

    /// `capacity - 1`, for wrapping slot indices
    mask: u32,

    /// Monotonically increasing write cursor, wraps modulo capacity
    cursor: UnsafeCell<u32>,
}
//
impl JobArena {
    /// Set up a ring of `capacity` idle slots (rounded up to a power of two)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        let slots = std::iter::repeat_with(Job::idle).take(capacity).collect();
        Self {
            slots,
            mask: (capacity - 1) as u32,
            cursor: UnsafeCell::new(0),
        }
    }

    /// Hand out the next slot index
    ///
    /// # Safety
    ///
    /// Only the participant that owns this ring may call this, and it must
    /// uphold the wraparound contract from the module docs: no more than
    /// `capacity` concurrently-live jobs drawn from this ring.
    pub unsafe fn allocate(&self) -> u32 {
        // SAFETY: Owner-only access per this method's precondition
        let cursor = unsafe { &mut *self.cursor.get() };
        let slot = *cursor & self.mask;
        *cursor = cursor.wrapping_add(1);
        slot
    }

    /// Resolve a slot index
    pub fn job(&self, slot: u32) -> &Job {
        &self.slots[(slot & self.mask) as usize]
    }
}
//
// SAFETY: Slot storage is Sync by Job's own protocol; the cursor is only
//         touched through the owner-only unsafe allocate()
unsafe impl Sync for JobArena {}
//
// SAFETY: Nothing in the arena is tied to a particular thread
unsafe impl Send for JobArena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up() {
        let arena = JobArena::new(1000);
        assert_eq!(arena.mask, 1023);
        assert_eq!(arena.slots.len(), 1024);
    }

    #[test]
    fn slots_are_distinct_until_wraparound() {
        let arena = JobArena::new(8);
        // SAFETY: Single-threaded test, we are the owner
        let slots: Vec<u32> = (0..8).map(|_| unsafe { arena.allocate() }).collect();
        assert_eq!(slots, (0..8).collect::<Vec<u32>>());
        // SAFETY: As above
        let wrapped = unsafe { arena.allocate() };
        assert_eq!(wrapped, 0, "ninth allocation reuses the first slot");
        assert!(std::ptr::eq(arena.job(wrapped), arena.job(slots[0])));
    }

    #[test]
    fn cursor_wrapping_is_well_defined_at_u32_max() {
        let arena = JobArena::new(4);
        // SAFETY: Single-threaded test, we are the owner
        unsafe { *arena.cursor.get() = u32::MAX };
        // SAFETY: As above
        assert_eq!(unsafe { arena.allocate() }, u32::MAX & arena.mask);
        // SAFETY: As above
        assert_eq!(unsafe { arena.allocate() }, 0);
    }
}
