/*!
Thread barrier: a single counter running 0..2N-1, where the lap (even or
odd N-block) is the sense. The last arriver of a lap wraps the counter back
by 2N; everyone else waits for the lap to flip.
*/

use std::sync::atomic::{AtomicU32, Ordering};

use crate::errhnd;
use crate::utils::doze;

/// Sense-counting barrier for a fixed number of threads.
pub struct Barrier {
    numthr: u32,
    waiting: AtomicU32,
}

#[inline]
fn lap(cnt: u32, nthr: u32) -> u32 {
    (cnt / nthr) % 2
}

impl Barrier {
    pub fn new(numthreads: u32) -> Self {
        if numthreads == 0 || numthreads > 0x1000_0000 {
            errhnd::report("barrier", "invalid number of threads", numthreads as usize);
        }
        Self {
            numthr: numthreads,
            waiting: AtomicU32::new(0),
        }
    }

    /// Wait until all threads have arrived.
    pub fn wait(&self) {
        let before = self.waiting.fetch_add(1, Ordering::AcqRel);
        if before + 1 == 2 * self.numthr {
            // Wrap back to zero; the count may already have incremented
            // again, so wrap incrementally with a subtraction.
            self.waiting.fetch_sub(2 * self.numthr, Ordering::Relaxed);
        } else {
            let numthr = self.numthr;
            let cur_lap = lap(before, numthr);
            while lap(self.waiting.load(Ordering::Acquire), numthr) == cur_lap {
                doze();
            }
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32 as Counter, Ordering::Relaxed};

    #[test]
    fn rounds() {
        const N: u32 = 4;
        const ROUNDS: usize = 50;
        let barrier = Barrier::new(N);
        let phase = Counter::new(0);
        std::thread::scope(|s| {
            for _ in 0..N {
                s.spawn(|| {
                    for r in 0..ROUNDS {
                        // Everyone must observe the same phase inside a
                        // round.
                        assert_eq!(phase.load(Relaxed) as usize, r);
                        barrier.wait();
                        phase.compare_exchange(r as u32, r as u32 + 1, Relaxed, Relaxed).ok();
                        barrier.wait();
                    }
                });
            }
        });
        assert_eq!(phase.load(Relaxed) as usize, ROUNDS);
    }
}
