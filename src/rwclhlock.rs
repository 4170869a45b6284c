/*!
Reader/writer CLH queue lock with optional sleep.

Each node carries a five-state word: `WAIT`, `SIGNAL_ACQ` (readers behind a
reader may enter), `SIGNAL_REL` (the predecessor has fully released), and
the `WAKE_*` forms of the two signals, set by a waiter whose spin budget ran
out and who parked on the word. The releaser detects a `WAKE_*` state and
issues a wake.

The spin budget is given in nanoseconds at lock creation;
[`SPIN_FOREVER`] disables parking entirely. On non-Linux targets parking
degrades to spinning with no behavioural difference.
*/

use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::time::{Duration, Instant};

use crate::utils::doze;

/// Spin forever, never park.
pub const SPIN_FOREVER: u32 = u32::MAX;

const WAIT: i32 = 0;
const SIGNAL_ACQ: i32 = 1;
const SIGNAL_REL: i32 = 2;
const WAKE_ACQ: i32 = SIGNAL_ACQ + 2;
const WAKE_REL: i32 = SIGNAL_REL + 2;

// Park/wake on an address. Futex on Linux; plain spinning elsewhere (the
// waiter simply returns and re-polls).

#[cfg(target_os = "linux")]
fn futex_wait(loc: &AtomicI32, val: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            loc as *const AtomicI32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            val,
            ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(loc: &AtomicI32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            loc as *const AtomicI32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_loc: &AtomicI32, _val: i32) {
    doze();
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_loc: &AtomicI32) {}

struct RwClhNode {
    prev: *mut RwClhNode,
    spin_tmo: u32,
    state: AtomicI32,
}

/// RW-CLH lock word plus the configured spin budget.
pub struct RwClhLock {
    tail: AtomicPtr<RwClhNode>,
    spin_tmo: u32,
}

/// Per-thread handle recycling the queue node across acquisitions.
pub struct RwClhHandle {
    node: *mut RwClhNode,
}

unsafe impl Send for RwClhHandle {}

fn alloc_node(spin_tmo: u32, state: i32) -> *mut RwClhNode {
    Box::into_raw(Box::new(RwClhNode {
        prev: ptr::null_mut(),
        spin_tmo,
        state: AtomicI32::new(state),
    }))
}

/// Wait for the predecessor to signal at least `sig`, parking after the
/// spin budget.
fn wait_prev(loc: &AtomicI32, sig: i32, spin_tmo: u32) {
    let mut actual = loc.load(Ordering::Acquire);
    if actual >= sig {
        return;
    }
    if spin_tmo == SPIN_FOREVER {
        while loc.load(Ordering::Acquire) < sig {
            doze();
        }
        return;
    }
    // Spin until the timeout.
    let deadline = Instant::now() + Duration::from_nanos(spin_tmo as u64);
    while Instant::now() < deadline {
        actual = loc.load(Ordering::Acquire);
        if actual >= sig {
            return;
        }
        doze();
    }
    // Spinning timed out: tell the previous thread to wake us, then sleep.
    loop {
        debug_assert!(actual != WAKE_ACQ && actual != WAKE_REL);
        let wakeup = sig + 2;
        match loc.compare_exchange(actual, wakeup, Ordering::Acquire, Ordering::Acquire) {
            Ok(_) => {
                futex_wait(loc, wakeup);
                actual = loc.load(Ordering::Acquire);
            }
            Err(cur) => actual = cur,
        }
        if actual >= sig {
            return;
        }
    }
}

/// Publish `sig` on our own node, waking a parked successor.
fn signal_next(loc: &AtomicI32, sig: i32) {
    debug_assert!(sig == SIGNAL_ACQ || sig == SIGNAL_REL);
    let mut old = WAIT;
    if loc
        .compare_exchange(old, sig, Ordering::Release, Ordering::Relaxed)
        .is_ok()
    {
        return;
    }
    old = loc.load(Ordering::Relaxed);
    loop {
        if old == WAKE_REL && sig == SIGNAL_ACQ {
            // The successor waits for a full release; don't wake it yet.
            return;
        }
        match loc.compare_exchange(old, sig, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(cur) => old = cur,
        }
    }
    if old == WAKE_ACQ || old == WAKE_REL {
        futex_wake(loc);
    }
}

impl RwClhLock {
    /// Create the lock; waiters spin for `spin_tmo_ns` nanoseconds before
    /// parking ([`SPIN_FOREVER`] to never park).
    pub fn new(spin_tmo_ns: u32) -> Self {
        Self {
            tail: AtomicPtr::new(alloc_node(spin_tmo_ns, SIGNAL_REL)),
            spin_tmo: spin_tmo_ns,
        }
    }

    fn enqueue(&self, handle: &mut RwClhHandle) -> *mut RwClhNode {
        if handle.node.is_null() {
            handle.node = alloc_node(self.spin_tmo, WAIT);
        }
        let node = handle.node;
        unsafe { &mut *node }.prev = ptr::null_mut();
        unsafe { &*node }.state.store(WAIT, Ordering::Relaxed);
        // Q0: read and write lock.tail, synchronize with Q0
        let prev = self.tail.swap(node, Ordering::AcqRel);
        unsafe { &mut *node }.prev = prev;
        prev
    }

    pub fn acquire_rd(&self, handle: &mut RwClhHandle) {
        let prev = self.enqueue(handle);
        let node = handle.node;
        // A0: read state waiting for ACQ (or REL), synchronize with A1/R3
        wait_prev(
            &unsafe { &*prev }.state,
            SIGNAL_ACQ,
            unsafe { &*node }.spin_tmo,
        );
        // Let any later readers in behind us.
        // A1: write state with ACQ, synchronize with A0
        signal_next(&unsafe { &*node }.state, SIGNAL_ACQ);
    }

    pub fn release_rd(&self, handle: &mut RwClhHandle) {
        let node = handle.node;
        let prev = unsafe { &*node }.prev;
        // Wait for the previous thread to fully release.
        // R0: read state waiting for REL, synchronize with R1
        wait_prev(
            &unsafe { &*prev }.state,
            SIGNAL_REL,
            unsafe { &*node }.spin_tmo,
        );
        // Now we own the previous node.
        // R1: write state with REL, synchronize with R0/R2
        signal_next(&unsafe { &*node }.state, SIGNAL_REL);
        handle.node = prev;
    }

    pub fn acquire_wr(&self, handle: &mut RwClhHandle) {
        let prev = self.enqueue(handle);
        let node = handle.node;
        // R2: read state waiting for REL, synchronize with R1/R3
        wait_prev(
            &unsafe { &*prev }.state,
            SIGNAL_REL,
            unsafe { &*node }.spin_tmo,
        );
    }

    pub fn release_wr(&self, handle: &mut RwClhHandle) {
        let node = handle.node;
        let prev = unsafe { &*node }.prev;
        // R3: write state with REL, synchronize with R2/A0
        signal_next(&unsafe { &*node }.state, SIGNAL_REL);
        handle.node = prev;
    }
}

impl Drop for RwClhLock {
    fn drop(&mut self) {
        let tail = *self.tail.get_mut();
        drop(unsafe { Box::from_raw(tail) });
    }
}

impl RwClhHandle {
    pub const fn new() -> Self {
        Self {
            node: ptr::null_mut(),
        }
    }
}

impl Default for RwClhHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RwClhHandle {
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
    fn rw_counting_spin() {
        run_counting(SPIN_FOREVER);
    }

    #[test]
    fn rw_counting_with_park() {
        // Tiny spin budget forces the futex path under contention.
        run_counting(1_000);
    }

    fn run_counting(tmo: u32) {
        let lock = RwClhLock::new(tmo);
        // Writers stamp both halves of a pair inside the critical section;
        // a reader admitted into a writer's window observes them unequal.
        let front = AtomicU32::new(0);
        let back = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let mut handle = RwClhHandle::new();
                    for _ in 0..500 {
                        lock.acquire_wr(&mut handle);
                        let v = front.load(Relaxed);
                        front.store(v + 1, Relaxed);
                        std::hint::spin_loop();
                        back.store(v + 1, Relaxed);
                        lock.release_wr(&mut handle);
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    let mut handle = RwClhHandle::new();
                    for _ in 0..500 {
                        lock.acquire_rd(&mut handle);
                        let f = front.load(Relaxed);
                        let b = back.load(Relaxed);
                        assert_eq!(f, b, "reader admitted inside a writer's window");
                        lock.release_rd(&mut handle);
                    }
                });
            }
        });
        assert_eq!(front.load(Relaxed), 1000);
        assert_eq!(back.load(Relaxed), 1000);
    }
}
