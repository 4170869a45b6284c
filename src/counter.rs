/*!
Distributed 64-bit counters.

A counter domain hands out counter ids from a bitmap. Each registered
thread keeps a private stash of counter values and adds to it without any
atomicity cost; [`read`] sums the shared base value plus every thread's
stash, pinning each stash with a hazard pointer while it is read.
Unregistering folds the private values into the shared location and retires
the stash, so threads that used a counter domain must also be registered
with a hazard-pointer domain.
*/

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crate::errhnd;
use crate::hazptr::{self, Hazard};
use crate::tidx;
use crate::utils::doze;
use crate::MAX_THREADS;

/// Counter id within a domain.
pub type Counter = u32;

/// Returned when no counter is free.
pub const COUNTER_INVALID: Counter = u32::MAX;

const BITS_PER_WORD: usize = 64;

/// Counter domain.
pub struct CntDomain {
    ncounters: u32,
    shared: Box<[AtomicU64]>,
    perthread: Box<[AtomicPtr<AtomicU64>]>,
    free: Box<[AtomicU64]>,
}

unsafe impl Send for CntDomain {}
unsafe impl Sync for CntDomain {}

// Per-thread stashes carry their length in slot 0; slots 1..=ncounters
// hold the counters. The retire callback reconstructs the box from it.

fn alloc_stash(ncounters: u32) -> *mut AtomicU64 {
    let len = ncounters as usize + 1;
    let stash: Box<[AtomicU64]> = (0..len).map(|_| AtomicU64::new(0)).collect();
    stash[0].store(len as u64, Ordering::Relaxed);
    Box::into_raw(stash) as *mut AtomicU64
}

unsafe fn free_stash(ptr: *mut ()) {
    let base = ptr as *mut AtomicU64;
    let len = unsafe { &*base }.load(Ordering::Relaxed) as usize;
    let slice = ptr::slice_from_raw_parts_mut(base, len);
    drop(unsafe { Box::from_raw(slice) });
}

thread_local! {
    static PTH: Cell<(i32, u32)> = const { Cell::new((-1, 0)) };
}

impl CntDomain {
    /// Allocate a domain of `ncounters` counters.
    pub fn new(ncounters: u32) -> Arc<Self> {
        // Counter 0 stands reserved as the null id.
        let ncounters = ncounters + 1;
        let nwords = (ncounters as usize).div_ceil(BITS_PER_WORD);
        let free: Box<[AtomicU64]> = (0..nwords).map(|_| AtomicU64::new(0)).collect();
        for b in 0..ncounters as usize {
            free[b / BITS_PER_WORD].fetch_or(1 << (b % BITS_PER_WORD), Ordering::Relaxed);
        }
        free[0].fetch_and(!1, Ordering::Relaxed);
        Arc::new(Self {
            ncounters,
            shared: (0..ncounters).map(|_| AtomicU64::new(0)).collect(),
            perthread: (0..MAX_THREADS).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            free,
        })
    }

    /// Register the calling thread with the domain (counted; may nest).
    pub fn register(&self) {
        let (mut tid, count) = PTH.with(|p| p.get());
        if count == 0 {
            let Some(idx) = tidx::alloc() else {
                errhnd::report("counter", "too many registered threads", MAX_THREADS);
                return;
            };
            tid = idx as i32;
        }
        PTH.with(|p| p.set((tid, count + 1)));
        if !self.perthread[tid as usize].load(Ordering::Relaxed).is_null() {
            errhnd::report("counter", "thread already registered", tid as usize);
            return;
        }
        let stash = alloc_stash(self.ncounters);
        // Publish the private counters.
        self.perthread[tid as usize].store(stash, Ordering::Release);
    }

    /// Unregister the calling thread, folding its private values into the
    /// shared counters. The stash is retired through the thread's
    /// hazard-pointer registration.
    pub fn unregister(&self) {
        let (tid, count) = PTH.with(|p| p.get());
        if count == 0 || tid < 0 {
            errhnd::report("counter", "thread not registered", 0);
            return;
        }
        let stash = self.perthread[tid as usize].load(Ordering::Relaxed);
        if stash.is_null() {
            errhnd::report("counter", "thread not registered", tid as usize);
            return;
        }
        for i in 0..self.ncounters as usize {
            let loc = unsafe { &*stash.add(1 + i) };
            let val = loc.load(Ordering::Relaxed);
            if val != 0 {
                loc.store(0, Ordering::Relaxed);
                self.shared[i].fetch_add(val, Ordering::Relaxed);
            }
        }
        // Unpublish, then retire the stash: readers may still hold it.
        self.perthread[tid as usize].store(ptr::null_mut(), Ordering::Release);
        while !unsafe { hazptr::retire(stash as *mut (), free_stash) } {
            doze();
        }
        let count = count - 1;
        if count == 0 {
            tidx::free(tid as u32);
            PTH.with(|p| p.set((-1, 0)));
        } else {
            PTH.with(|p| p.set((tid, count)));
        }
    }

    /// Allocate a counter id, or [`COUNTER_INVALID`] when all are taken.
    pub fn alloc(&self) -> Counter {
        for (i, word) in self.free.iter().enumerate() {
            let mut w = word.load(Ordering::Relaxed);
            while w != 0 {
                let b = w.trailing_zeros() as usize;
                match word.compare_exchange(
                    w,
                    w & !(1 << b),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let cntid = (i * BITS_PER_WORD + b) as u32;
                        self.shared[cntid as usize].store(0, Ordering::Relaxed);
                        return cntid;
                    }
                    Err(cur) => w = cur,
                }
            }
        }
        COUNTER_INVALID
    }

    /// Return a counter id to the domain.
    pub fn free(&self, cntid: Counter) {
        if cntid == COUNTER_INVALID || cntid >= self.ncounters {
            errhnd::report("counter", "invalid counter", cntid as usize);
            return;
        }
        let word = &self.free[cntid as usize / BITS_PER_WORD];
        let bit = 1 << (cntid as usize % BITS_PER_WORD);
        if word.load(Ordering::Relaxed) & bit != 0 {
            errhnd::report("counter", "counter already free", cntid as usize);
            return;
        }
        word.fetch_or(bit, Ordering::Release);
    }

    /// Add to a counter through the calling thread's private stash.
    pub fn add(&self, cntid: Counter, val: u64) {
        let (tid, count) = PTH.with(|p| p.get());
        if count == 0 {
            errhnd::report("counter", "thread not registered", 0);
            return;
        }
        if cntid == COUNTER_INVALID || cntid >= self.ncounters {
            errhnd::report("counter", "invalid counter", cntid as usize);
            return;
        }
        let stash = self.perthread[tid as usize].load(Ordering::Relaxed);
        let loc = unsafe { &*stash.add(1 + cntid as usize) };
        // Only the owner writes the stash; a plain read-modify-write.
        let old = loc.load(Ordering::Relaxed);
        loc.store(old + val, Ordering::Relaxed);
    }

    /// Read a counter: the shared base plus every thread's private value.
    pub fn read(&self, cntid: Counter) -> u64 {
        if cntid == COUNTER_INVALID || cntid >= self.ncounters {
            errhnd::report("counter", "invalid counter", cntid as usize);
            return 0;
        }
        let mut hp = Hazard::null();
        let mut sum = self.shared[cntid as usize].load(Ordering::Relaxed);
        for t in 0..MAX_THREADS {
            let stash = hazptr::acquire(&self.perthread[t], &mut hp);
            if !stash.is_null() {
                sum += unsafe { &*stash.add(1 + cntid as usize) }.load(Ordering::Relaxed);
            }
        }
        hazptr::release(&mut hp);
        sum
    }

    /// Reset a counter to zero (as observed by a concurrent read).
    pub fn reset(&self, cntid: Counter) {
        if cntid == COUNTER_INVALID || cntid >= self.ncounters {
            errhnd::report("counter", "invalid counter", cntid as usize);
            return;
        }
        let cur = self.read(cntid);
        self.shared[cntid as usize].fetch_sub(cur, Ordering::Relaxed);
    }
}

impl Drop for CntDomain {
    fn drop(&mut self) {
        for t in 0..MAX_THREADS {
            if !self.perthread[t].load(Ordering::Relaxed).is_null() {
                errhnd::report("counter", "registered threads still present", t);
                return;
            }
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazptr::HpDomain;

    #[test]
    fn distributed_sum() {
        let hpd = HpDomain::new(64, 4).unwrap();
        hazptr::register(&hpd);
        let cd = CntDomain::new(4);
        cd.register();
        let c = cd.alloc();
        assert_ne!(c, COUNTER_INVALID);

        cd.add(c, 5);
        cd.add(c, 7);
        assert_eq!(cd.read(c), 12);

        std::thread::scope(|s| {
            s.spawn(|| {
                hazptr::register(&hpd);
                cd.register();
                cd.add(c, 100);
                assert_eq!(cd.read(c), 112);
                cd.unregister();
                hazptr::reclaim();
                hazptr::unregister();
            });
        });
        // The other thread folded its stash into the shared value.
        assert_eq!(cd.read(c), 112);

        cd.reset(c);
        assert_eq!(cd.read(c), 0);

        cd.free(c);
        cd.unregister();
        hazptr::reclaim();
        hazptr::unregister();
    }
}
