/*!
Ticket lock: strict FIFO over a 16-bit ticket counter and a 16-bit serving
counter. Waiters that are further back apply a back-off proportional to
their distance from the head of the queue.
*/

use std::sync::atomic::{AtomicU16, Ordering};

use crate::utils::doze;

/// FIFO ticket lock.
#[repr(C)]
pub struct TktLock {
    next: AtomicU16,
    serving: AtomicU16,
}

impl TktLock {
    pub const fn new() -> Self {
        Self {
            next: AtomicU16::new(0),
            serving: AtomicU16::new(0),
        }
    }

    /// Acquire with a back-off of `time` spin iterations per waiter ahead
    /// of us.
    pub fn acquire_bkoff(&self, time: u32) {
        // Take a ticket.
        let tkt = self.next.fetch_add(1, Ordering::Relaxed);
        loop {
            let cur = self.serving.load(Ordering::Acquire);
            if cur == tkt {
                return;
            }
            let dist = tkt.wrapping_sub(cur);
            if dist == 1 {
                // We are next, no back-off.
                while self.serving.load(Ordering::Acquire) != tkt {
                    doze();
                }
                return;
            }
            for _ in 0..(dist as u32 - 1) * time {
                doze();
            }
        }
    }

    pub fn acquire(&self) {
        self.acquire_bkoff(192);
    }

    pub fn try_acquire(&self) -> bool {
        let cur = self.serving.load(Ordering::Relaxed);
        if self.next.load(Ordering::Relaxed) != cur {
            return false;
        }
        // Grab the next ticket only if it is the one being served.
        self.next
            .compare_exchange(cur, cur.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Hand the lock to the next ticket holder.
    pub fn release(&self) {
        let cur = self.serving.load(Ordering::Relaxed);
        self.serving.store(cur.wrapping_add(1), Ordering::Release);
    }
}

impl Default for TktLock {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------
