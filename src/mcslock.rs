/*!
MCS queue lock.

Like CLH the lock is a queue tail, but each waiter spins on its *own* node
and the releaser follows its `next` pointer to signal the successor. Nodes
are caller-owned (typically stack-allocated) and live only for the
acquisition.
*/

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::utils::{doze, wait_until_not_equal_ptr};

const GO: u8 = 0;
const WAIT: u8 = 1;

/// Per-acquisition queue node; must stay in place between `acquire` and
/// `release`.
pub struct McsNode {
    next: AtomicPtr<McsNode>,
    wait: AtomicU8,
}

impl McsNode {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            wait: AtomicU8::new(GO),
        }
    }
}

impl Default for McsNode {
    fn default() -> Self {
        Self::new()
    }
}

/// MCS lock word: the queue tail, null when free.
pub struct McsLock {
    tail: AtomicPtr<McsNode>,
}

impl McsLock {
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquire the lock using the caller's node.
    pub fn acquire(&self, node: &McsNode) {
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.wait.store(WAIT, Ordering::Relaxed);
        let me = node as *const McsNode as *mut McsNode;
        // A0: read and write tail, synchronize with A0/A1
        let prev = self.tail.swap(me, Ordering::AcqRel);
        if prev.is_null() {
            // Uncontended, the lock is ours.
            return;
        }
        // B0: write next, synchronize with B1/B2
        unsafe { &*prev }.next.store(me, Ordering::Release);
        // Wait for the previous thread to signal us through our node.
        // C0: read wait, synchronize with C1
        while node.wait.load(Ordering::Acquire) != GO {
            doze();
        }
    }

    /// Release the lock acquired with `node`.
    pub fn release(&self, node: &McsNode) {
        let me = node as *const McsNode as *mut McsNode;
        // B1: read next, synchronize with B0
        let mut next = node.next.load(Ordering::Acquire);
        if next.is_null() {
            // No waiter visible, try to release outright.
            // A1: write tail, synchronize with A0
            if self
                .tail
                .compare_exchange(me, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // A waiter is in the middle of enqueueing; wait for it to link
            // its node to ours.
            // B2: read next, synchronize with B0
            next = wait_until_not_equal_ptr(&node.next, ptr::null_mut(), Ordering::Acquire);
        }
        // C1: write wait, synchronize with C0
        unsafe { &*next }.wait.store(GO, Ordering::Release);
    }
}

impl Default for McsLock {
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
    fn counting() {
        let lock = McsLock::new();
        let counter = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let node = McsNode::new();
                        lock.acquire(&node);
                        let v = counter.load(Relaxed);
                        counter.store(v + 1, Relaxed);
                        lock.release(&node);
                    }
                });
            }
        });
        assert_eq!(counter.load(Relaxed), 4000);
    }
}
