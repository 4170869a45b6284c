/*!
Basic test-and-set spinlock.

One byte of state: 0 = free, 1 = held. No fairness guarantee. The
[`SpinLock::release_ro`] variant is for critical sections that performed no
stores; it only orders loads.
*/

use crate::sync::atomic::{AtomicU8, Ordering};
use crate::utils::doze;

/// Unfair test-and-set spinlock.
pub struct SpinLock {
    lock: AtomicU8,
}

impl SpinLock {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            lock: AtomicU8::new(0),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            lock: AtomicU8::new(0),
        }
    }

    #[inline]
    fn try_lock(&self, weak: bool) -> bool {
        // Weak is normally better when spinning and retrying.
        let r = if weak {
            self.lock
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        } else {
            self.lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        };
        r.is_ok()
    }

    /// Spin until the lock is acquired.
    pub fn acquire(&self) {
        loop {
            // Wait until the lock looks free before attempting the CAS.
            while self.lock.load(Ordering::Relaxed) != 0 {
                doze();
            }
            if self.try_lock(true) {
                return;
            }
        }
    }

    /// One strong CAS against the free state; never spins.
    pub fn try_acquire(&self) -> bool {
        if self.lock.load(Ordering::Relaxed) == 0 {
            return self.try_lock(false);
        }
        false
    }

    /// Release the lock, ordering both loads and stores.
    pub fn release(&self) {
        self.lock.store(0, Ordering::Release);
    }

    /// Release after a read-only critical section; orders loads only.
    pub fn release_ro(&self) {
        crate::sync::atomic::fence(Ordering::Acquire);
        self.lock.store(0, Ordering::Relaxed);
    }
}

#[cfg(not(loom))]
impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

    #[test]
    fn uncontended() {
        let lock = SpinLock::new();
        lock.acquire();
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release_ro();
    }

    #[test]
    fn mutual_exclusion() {
        let lock = SpinLock::new();
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
