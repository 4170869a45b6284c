/*!
Hemlock: a queue lock without queue nodes.

Each thread owns a single thread-local *grant* cell. The lock word is the
tail of an implicit queue of grant-cell addresses; a releaser stores the
lock's address into its own grant cell, the successor polls that cell and
acks by clearing it. FIFO, one word per lock plus one word per thread.

A thread that is waiting on or holding a Hemlock must outlive the handoff:
the grant cell lives in thread-local storage.
*/

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::utils::wait_until_equal_ptr;

/// Hemlock word: tail of the queue of grant cells, null when free.
pub struct Hemlock {
    tail: AtomicPtr<AtomicPtr<Hemlock>>,
}

thread_local! {
    static GRANT: AtomicPtr<Hemlock> = const { AtomicPtr::new(ptr::null_mut()) };
}

#[inline]
fn my_grant() -> *mut AtomicPtr<Hemlock> {
    GRANT.with(|g| g as *const AtomicPtr<Hemlock> as *mut AtomicPtr<Hemlock>)
}

impl Hemlock {
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// One strong CAS against the free state; never spins.
    pub fn try_acquire(&self) -> bool {
        // tail == null means the lock is free.
        // A0: read and write tail, synchronize with A0/A1/A2
        self.tail
            .compare_exchange(
                ptr::null_mut(),
                my_grant(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn acquire(&self) {
        // A1: read and write tail, synchronize with A0/A1/A2
        let pred = self.tail.swap(my_grant(), Ordering::AcqRel);
        if pred.is_null() {
            // Uncontended.
            return;
        }
        // Wait for the predecessor to store this lock's address into its
        // grant cell.
        // B0: read pred, synchronize with B1
        let me = self as *const Hemlock as *mut Hemlock;
        wait_until_equal_ptr(unsafe { &*pred }, me, Ordering::Acquire);
        // Ack the grant so the cell can be reused.
        // C0: write pred, signal C1
        unsafe { &*pred }.store(ptr::null_mut(), Ordering::Relaxed);
    }

    pub fn release(&self) {
        let grant = my_grant();
        // tail == &grant means no waiters.
        // A2: write tail, synchronize with A0/A1
        if self
            .tail
            .compare_exchange(grant, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        // Signal the first waiter, which is polling our grant cell.
        // B1: write pred, synchronize with B0
        let me = self as *const Hemlock as *mut Hemlock;
        unsafe { &*grant }.store(me, Ordering::Release);
        // Wait for the waiter to ack so the grant cell can be reused.
        // C1: read pred, wait-on C0
        wait_until_equal_ptr(unsafe { &*grant }, ptr::null_mut(), Ordering::Relaxed);
    }
}

impl Default for Hemlock {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

    #[test]
    fn try_acquire_excludes() {
        let lock = Hemlock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn counting() {
        let lock = Hemlock::new();
        let counter = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        lock.acquire();
                        let v = counter.load(Relaxed);
                        counter.store(v + 1, Relaxed);
                        lock.release();
                    }
                });
            }
        });
        assert_eq!(counter.load(Relaxed), 4000);
    }
}
