/*!
Counting semaphore packed into one 64-bit word: acquisitions in the high 32
bits, releases (initially the count) in the low 32 bits. Acquirers fetch-add
their demand and wait until `rel >= acq + n`, which makes the semaphore
FIFO-fair in bulk.
*/

use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::doze;

const ACQ_ONE: u64 = 1 << 32;

#[inline]
fn to_acq(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
fn to_rel(word: u64) -> u32 {
    word as u32
}

/// FIFO counting semaphore.
pub struct Semaphore {
    word: AtomicU64,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self {
            word: AtomicU64::new(count as u64),
        }
    }

    /// Acquire `n` units, waiting until they are available.
    pub fn acquire_n(&self, n: u32) {
        let word = self.word.fetch_add(n as u64 * ACQ_ONE, Ordering::Acquire);
        let acq = to_acq(word);
        let rel = to_rel(word);
        let need = acq.wrapping_add(n);
        if (rel.wrapping_sub(need) as i32) < 0 {
            while (to_rel(self.word.load(Ordering::Acquire)).wrapping_sub(need) as i32) < 0 {
                doze();
            }
        }
    }

    pub fn acquire(&self) {
        self.acquire_n(1);
    }

    /// Release `n` units.
    pub fn release_n(&self, n: u32) {
        self.word.fetch_add(n as u64, Ordering::Release);
    }

    pub fn release(&self) {
        self.release_n(1);
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

    #[test]
    fn counts() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
        sem.release();
        sem.acquire();
        sem.release_n(2);
    }

    #[test]
    fn bounded_concurrency() {
        let sem = Semaphore::new(1);
        let counter = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        sem.acquire();
                        let v = counter.load(Relaxed);
                        counter.store(v + 1, Relaxed);
                        sem.release();
                    }
                });
            }
        });
        assert_eq!(counter.load(Relaxed), 2000);
    }
}
