/*!
Reciprocating lock.

Arriving threads push themselves onto an arrivals stack. A releaser with no
appointed successor detaches the whole arrivals segment; ownership then
travels through the detached segment via per-node gates, giving FIFO order
within each segment. Based on the reciprocating-lock construction of
Dice & Kogan.
*/

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::utils::{doze, wait_until_not_equal_ptr};

/// An otherwise invalid pointer marking "locked, no queued segment".
const LOCKED_EMPTY: *mut RpNode = 1 as *mut RpNode;

/// Per-acquisition node; must stay in place from `acquire` to `release`.
pub struct RpNode {
    gate: AtomicPtr<RpNode>,
    succ: *mut RpNode,
    eos: *mut RpNode,
}

impl RpNode {
    pub const fn new() -> Self {
        Self {
            gate: AtomicPtr::new(ptr::null_mut()),
            succ: ptr::null_mut(),
            eos: ptr::null_mut(),
        }
    }
}

impl Default for RpNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Reciprocating lock word: the arrivals stack.
pub struct RpLock {
    arrivals: AtomicPtr<RpNode>,
}

impl RpLock {
    pub const fn new() -> Self {
        Self {
            arrivals: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// One strong CAS against the empty arrivals stack; never spins.
    pub fn try_acquire(&self, node: &mut RpNode) -> bool {
        node.gate.store(ptr::null_mut(), Ordering::Relaxed);
        node.succ = ptr::null_mut();
        let me = node as *mut RpNode;
        node.eos = me;
        // A0r: read arrivals, synchronize with A0w/A2
        // A0w: write arrivals, synchronize with A0r/A1
        self.arrivals
            .compare_exchange(ptr::null_mut(), me, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn acquire(&self, node: &mut RpNode) {
        node.gate.store(ptr::null_mut(), Ordering::Relaxed);
        node.succ = ptr::null_mut();
        let me = node as *mut RpNode;
        node.eos = me;
        // A0r: read arrivals, synchronize with A0w/A2
        // A0w: write arrivals, synchronize with A0r/A1
        let tail = self.arrivals.swap(me, Ordering::AcqRel);
        if !tail.is_null() {
            node.succ = ((tail as usize) & !1) as *mut RpNode;
            // Wait for our gate to open; the value passed in is the
            // end-of-segment marker.
            // B0: read gate, synchronize with B1
            node.eos = wait_until_not_equal_ptr(&node.gate, ptr::null_mut(), Ordering::Acquire);
            if node.succ == node.eos {
                // We are the last of the segment.
                node.succ = ptr::null_mut();
                node.eos = LOCKED_EMPTY;
            }
        }
    }

    pub fn release(&self, node: &mut RpNode) {
        // Entry segment populated: appoint the successor.
        if !node.succ.is_null() {
            // B1: write gate, synchronize with B0
            unsafe { &*node.succ }.gate.store(node.eos, Ordering::Release);
            return;
        }
        // Entry segment and arrivals both empty: fast-path unlock.
        let me = node as *mut RpNode;
        let expected = if node.eos == LOCKED_EMPTY { LOCKED_EMPTY } else { me };
        // A2: write arrivals, synchronize with A0r
        if self
            .arrivals
            .compare_exchange(expected, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        // New threads arrived: detach the arrivals segment and shift it to
        // become the next entry segment.
        // A1: read arrivals, synchronize with A0w
        let w = self.arrivals.swap(LOCKED_EMPTY, Ordering::Acquire);
        debug_assert!(!w.is_null() && w != LOCKED_EMPTY && w != me);
        // B1: write gate, synchronize with B0
        unsafe { &*w }.gate.store(node.eos, Ordering::Release);
    }
}

impl Default for RpLock {
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
        let lock = RpLock::new();
        let mut a = RpNode::new();
        let mut b = RpNode::new();
        assert!(lock.try_acquire(&mut a));
        assert!(!lock.try_acquire(&mut b));
        lock.release(&mut a);
        assert!(lock.try_acquire(&mut b));
        lock.release(&mut b);
    }

    #[test]
    fn counting() {
        let lock = RpLock::new();
        let counter = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let mut node = RpNode::new();
                        lock.acquire(&mut node);
                        let v = counter.load(Relaxed);
                        counter.store(v + 1, Relaxed);
                        lock.release(&mut node);
                    }
                });
            }
        });
        assert_eq!(counter.load(Relaxed), 4000);
    }
}
