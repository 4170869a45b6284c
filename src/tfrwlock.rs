/*!
Task-fair reader/writer lock.

Two 32-bit words, each holding a 16-bit writer half (low) and a 16-bit
reader half (high): `enter` is bumped on arrival, `leave` on departure.
Readers wait for all earlier writers to leave; a writer waits for its exact
`(leave.rd, leave.wr)` snapshot, i.e. for every earlier reader and writer.
Arrival order is served FIFO across both kinds.
*/

use std::sync::atomic::{AtomicU32, Ordering};

use crate::utils::doze;

const RD_ONE: u32 = 1 << 16;
const WR_ONE: u32 = 1;
const WR_MASK: u32 = 0xffff;

#[inline]
fn to_wr(x: u32) -> u32 {
    x & WR_MASK
}

/// Writer ticket returned by [`TfRwLock::acquire_wr`].
pub type WrTicket = u16;

/// Task-fair RW lock.
#[repr(C)]
pub struct TfRwLock {
    enter: AtomicU32,
    leave: AtomicU32,
}

/// Fetch-add on the writer half only, leaving the reader half untouched
/// even on wrap-around.
fn atomic_add_w_mask(loc: &AtomicU32, val: u32, mask: u32) -> u32 {
    let mut old = loc.load(Ordering::Relaxed);
    loop {
        let new = (old.wrapping_add(val) & mask) | (old & !mask);
        match loc.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return old,
            Err(actual) => old = actual,
        }
    }
}

impl TfRwLock {
    pub const fn new() -> Self {
        Self {
            enter: AtomicU32::new(0),
            leave: AtomicU32::new(0),
        }
    }

    pub fn acquire_rd(&self) {
        // Record one more reader entering.
        let old_enter = self.enter.fetch_add(RD_ONE, Ordering::Relaxed);
        // Wait for all earlier writers to leave.
        while to_wr(self.leave.load(Ordering::Acquire)) != to_wr(old_enter) {
            doze();
        }
    }

    pub fn release_rd(&self) {
        // Record one more reader leaving.
        self.leave.fetch_add(RD_ONE, Ordering::Release);
    }

    pub fn acquire_wr(&self) -> WrTicket {
        // Take a writer ticket without disturbing the reader half.
        let old_enter = atomic_add_w_mask(&self.enter, WR_ONE, WR_MASK);
        // Wait for our turn among writers and for all earlier readers to
        // leave. Later arrivals of either kind wait for us.
        while self.leave.load(Ordering::Acquire) != old_enter {
            doze();
        }
        to_wr(old_enter) as WrTicket
    }

    pub fn release_wr(&self, tkt: WrTicket) {
        // Bump the writer half of leave to our ticket + 1.
        let mut old = self.leave.load(Ordering::Relaxed);
        loop {
            let new = (old & !WR_MASK) | (tkt.wrapping_add(1) as u32);
            match self
                .leave
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }
}

impl Default for TfRwLock {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32 as Counter, Ordering::Relaxed};

    #[test]
    fn uncontended() {
        let lock = TfRwLock::new();
        lock.acquire_rd();
        lock.release_rd();
        let t = lock.acquire_wr();
        lock.release_wr(t);
        lock.acquire_rd();
        lock.release_rd();
    }

    #[test]
    fn mixed_counting() {
        let lock = TfRwLock::new();
        let counter = Counter::new(0);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let t = lock.acquire_wr();
                        let v = counter.load(Relaxed);
                        counter.store(v + 1, Relaxed);
                        lock.release_wr(t);
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..500 {
                        lock.acquire_rd();
                        let _ = counter.load(Relaxed);
                        lock.release_rd();
                    }
                });
            }
        });
        assert_eq!(counter.load(Relaxed), 1000);
    }
}
