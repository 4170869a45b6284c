/*!
Writer-preference reader/writer lock in a single 32-bit word: the top bit is
the writer flag, the rest count readers. A writer sets its flag first and
then waits out the readers, so new readers cannot starve it.
*/

use std::sync::atomic::{AtomicU32, Ordering};

use crate::errhnd;
use crate::utils::doze;

const WRITER: u32 = 1 << 31;
const READERS: u32 = !WRITER;

/// Writer-preference RW lock.
pub struct RwLock {
    word: AtomicU32,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    #[inline]
    fn wait_for_no(&self, mask: u32, order: Ordering) -> u32 {
        let mut l = self.word.load(order);
        while l & mask != 0 {
            doze();
            l = self.word.load(order);
        }
        l
    }

    pub fn acquire_rd(&self) {
        loop {
            // Wait for any present writer to go away.
            let l = self.wait_for_no(WRITER, Ordering::Relaxed);
            // A0: read lock.w, synchronize with A3
            if self
                .word
                .compare_exchange_weak(l, l + 1, Ordering::Acquire, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn try_acquire_rd(&self) -> bool {
        let l = self.word.load(Ordering::Relaxed);
        if l & WRITER != 0 {
            return false;
        }
        // A1: read lock.w, synchronize with A3
        self.word
            .compare_exchange(l, l + 1, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_rd(&self) {
        // B0: write lock.r, synchronize with B1/B2
        let prev = self.word.fetch_sub(1, Ordering::Release);
        if prev & READERS == 0 {
            errhnd::report("rwlock", "invalid read release", self as *const _ as usize);
        }
    }

    pub fn acquire_wr(&self) {
        loop {
            let l = self.wait_for_no(WRITER, Ordering::Relaxed);
            // A2: read lock.w, synchronize with A3
            if self
                .word
                .compare_exchange_weak(l, l | WRITER, Ordering::Acquire, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        // Wait for any present readers to go away.
        // B1: read lock.r, synchronize with B0
        self.wait_for_no(READERS, Ordering::Acquire);
    }

    /// Succeeds only when the lock is completely free; never waits out
    /// readers.
    pub fn try_acquire_wr(&self) -> bool {
        let l = self.word.load(Ordering::Relaxed);
        // B2: read lock.r, synchronize with B0
        l == 0
            && self
                .word
                .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Acquire)
                .is_ok()
    }

    pub fn release_wr(&self) {
        if self.word.load(Ordering::Relaxed) != WRITER {
            errhnd::report("rwlock", "invalid write release", self as *const _ as usize);
            return;
        }
        // A3: write lock.w, synchronize with A0/A1/A2
        self.word.store(0, Ordering::Release);
    }
}

impl Default for RwLock {
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
    fn readers_share_writers_exclude() {
        let lock = RwLock::new();
        lock.acquire_rd();
        assert!(lock.try_acquire_rd());
        assert!(!lock.try_acquire_wr());
        lock.release_rd();
        lock.release_rd();
        assert!(lock.try_acquire_wr());
        assert!(!lock.try_acquire_rd());
        lock.release_wr();
    }

    #[test]
    fn writer_counting() {
        let lock = RwLock::new();
        let counter = Counter::new(0);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        lock.acquire_wr();
                        let v = counter.load(Relaxed);
                        counter.store(v + 1, Relaxed);
                        lock.release_wr();
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..1000 {
                    lock.acquire_rd();
                    let _ = counter.load(Relaxed);
                    lock.release_rd();
                }
            });
        });
        assert_eq!(counter.load(Relaxed), 2000);
    }
}
