/*!
CLH queue lock.

Each acquisition enqueues a node and spins on the *predecessor's* `wait`
flag, so every waiter spins on a distinct cache line and handoff is strict
FIFO. After the handoff the thread owns the predecessor's node; the handle
keeps it for the next acquisition.
*/

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::utils::doze;

const GO: u8 = 0;
const WAIT: u8 = 1;

struct ClhNode {
    prev: *mut ClhNode,
    wait: AtomicU8,
}

/// CLH lock word: the queue tail.
pub struct ClhLock {
    tail: AtomicPtr<ClhNode>,
}

/// Per-thread handle holding the node recycled across acquisitions.
pub struct ClhHandle {
    node: *mut ClhNode,
}

// The node travels between threads on release.
unsafe impl Send for ClhHandle {}

fn alloc_node(wait: u8) -> *mut ClhNode {
    Box::into_raw(Box::new(ClhNode {
        prev: ptr::null_mut(),
        wait: AtomicU8::new(wait),
    }))
}

impl ClhLock {
    pub fn new() -> Self {
        Self {
            tail: AtomicPtr::new(alloc_node(GO)),
        }
    }

    /// Acquire the lock; the handle must be used for the matching
    /// [`ClhLock::release`].
    pub fn acquire(&self, handle: &mut ClhHandle) {
        if handle.node.is_null() {
            handle.node = alloc_node(WAIT);
        }
        let node = handle.node;
        unsafe { &*node }.wait.store(WAIT, Ordering::Relaxed);

        // Insert our node last in the queue, get back the previous tail.
        // A0: read and write tail, synchronize with A0
        let prev = self.tail.swap(node, Ordering::AcqRel);
        unsafe { &mut *node }.prev = prev;

        // Wait for the previous thread to signal us through their node.
        // B0: read wait, synchronize with B1
        while unsafe { &*prev }.wait.load(Ordering::Acquire) != GO {
            doze();
        }
        // Now we own the previous node.
    }

    /// Release the lock acquired through `handle`.
    pub fn release(&self, handle: &mut ClhHandle) {
        let node = handle.node;
        let prev = unsafe { &*node }.prev;
        // Signal whichever thread waits on our old node.
        // B1: write wait, synchronize with B0
        unsafe { &*node }.wait.store(GO, Ordering::Release);
        // The previous node is ours now.
        handle.node = prev;
    }
}

impl Default for ClhLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClhLock {
    fn drop(&mut self) {
        let tail = *self.tail.get_mut();
        drop(unsafe { Box::from_raw(tail) });
    }
}

impl ClhHandle {
    pub const fn new() -> Self {
        Self {
            node: ptr::null_mut(),
        }
    }
}

impl Default for ClhHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClhHandle {
    fn drop(&mut self) {
        if !self.node.is_null() {
            drop(unsafe { Box::from_raw(self.node) });
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

    #[test]
    fn fifo_counting() {
        let lock = ClhLock::new();
        let counter = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut handle = ClhHandle::new();
                    for _ in 0..1000 {
                        lock.acquire(&mut handle);
                        let v = counter.load(Relaxed);
                        counter.store(v + 1, Relaxed);
                        lock.release(&mut handle);
                    }
                });
            }
        });
        assert_eq!(counter.load(Relaxed), 4000);
    }
}
