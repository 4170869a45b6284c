/*!
Quiescent-state based reclamation.

A [`QsbrDomain`] keeps a monotonic 64-bit interval counter and one published
interval per registered thread. Retiring an object advances the counter and
tags the object with the pre-increment value; the object becomes reclaimable
once every active thread has published a strictly later interval (inactive
threads publish "infinity" and are ignored).

[`acquire`]/[`release`] are reference counted: the outermost release marks
the thread inactive, so container-internal bracketing composes with a
caller-held read-side region. [`quiescent`] publishes the current interval
and is equivalent to "no references held beyond this point".
*/

use std::cell::RefCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::errhnd;
use crate::tidx;
use crate::utils::CachePadded;
use crate::MAX_THREADS;

/// Larger than every possible interval; published by inactive threads.
const INFINITE: u64 = u64::MAX;

// -------------------------------------

/// QSBR domain: interval counter plus per-thread published intervals.
pub struct QsbrDomain {
    current: CachePadded<AtomicU64>,
    maxobjs: u32,
    high_wm: AtomicU64,
    intervals: Box<[CachePadded<AtomicU64>]>,
}

impl QsbrDomain {
    /// Create a domain with room for `maxobjs` pending retired objects per
    /// thread.
    pub fn new(maxobjs: u32) -> Option<Arc<Self>> {
        if maxobjs == 0 {
            errhnd::report("qsbr", "invalid number of objects", 0);
            return None;
        }
        let intervals = (0..MAX_THREADS)
            .map(|_| CachePadded::new(AtomicU64::new(INFINITE)))
            .collect();
        Some(Arc::new(Self {
            current: CachePadded::new(AtomicU64::new(0)),
            maxobjs,
            high_wm: AtomicU64::new(0),
            intervals,
        }))
    }

    /// Smallest interval published by any thread below the high watermark.
    fn min_interval(&self) -> u64 {
        let nthreads = self.high_wm.load(Ordering::Acquire) as usize;
        let mut min = INFINITE;
        for t in 0..nthreads {
            let i = self.intervals[t].load(Ordering::Acquire);
            if i < min {
                min = i;
            }
        }
        min
    }
}

impl Drop for QsbrDomain {
    fn drop(&mut self) {
        if self.min_interval() != INFINITE {
            errhnd::report("qsbr", "registered threads still present", 0);
        }
    }
}

// -------------------------------------

struct Retired {
    ptr: *mut (),
    cb: unsafe fn(*mut ()),
    interval: u64,
}

struct ThreadState {
    domain: Arc<QsbrDomain>,
    idx: u32,
    /// Last interval this thread published.
    interval: u64,
    /// Read-side region nesting depth.
    nest: u32,
    objs: Vec<Retired>,
}

thread_local! {
    static TS: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

fn with_ts<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    TS.with(|cell| {
        let mut borrow = cell.borrow_mut();
        match borrow.as_mut() {
            Some(ts) => f(ts),
            None => {
                errhnd::report("qsbr", "thread not registered", 0);
                panic!("qsbr: thread not registered");
            }
        }
    })
}

/// Register the calling thread with a domain. Idempotent for the same
/// domain; a thread registers with at most one QSBR domain at a time.
pub fn register(domain: &Arc<QsbrDomain>) {
    TS.with(|cell| {
        let mut borrow = cell.borrow_mut();
        if let Some(ts) = borrow.as_ref() {
            if !Arc::ptr_eq(&ts.domain, domain) {
                errhnd::report("qsbr", "already registered with other domain", 0);
            }
            return;
        }
        let Some(idx) = tidx::alloc() else {
            errhnd::report("qsbr", "too many registered threads", MAX_THREADS);
            return;
        };
        domain.high_wm.fetch_max(idx as u64 + 1, Ordering::Relaxed);
        debug_assert_eq!(domain.intervals[idx as usize].load(Ordering::Relaxed), INFINITE);
        *borrow = Some(ThreadState {
            domain: Arc::clone(domain),
            idx,
            interval: INFINITE,
            nest: 0,
            objs: Vec::with_capacity(domain.maxobjs as usize),
        });
    });
}

/// Unregister the calling thread. Fails (reporting an error) when retired
/// objects are still pending.
pub fn unregister() -> bool {
    TS.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let Some(ts) = borrow.as_mut() else {
            return true;
        };
        if !ts.objs.is_empty() {
            errhnd::report("qsbr", "thread has unreclaimed objects", ts.objs.len());
            return false;
        }
        // Mark thread as inactive, no references kept.
        ts.domain.intervals[ts.idx as usize].store(INFINITE, Ordering::Release);
        tidx::free(ts.idx);
        *borrow = None;
        true
    })
}

// -------------------------------------

/// Enter a read-side region (reference counted). The outermost acquire
/// publishes the domain's current interval for this thread.
pub fn acquire() {
    with_ts(|ts| {
        ts.nest += 1;
        if ts.nest > 1 {
            return;
        }
        let interval = ts.domain.current.load(Ordering::Relaxed);
        ts.domain.intervals[ts.idx as usize].store(interval, Ordering::Relaxed);
        ts.interval = interval;
        // Our interval must be observable before any of our reads are.
        fence(Ordering::SeqCst);
    });
}

/// Leave a read-side region. The outermost release marks the thread
/// inactive.
pub fn release() {
    with_ts(|ts| {
        if ts.nest == 0 {
            errhnd::report("qsbr", "release without acquire", 0);
            return;
        }
        ts.nest -= 1;
        if ts.nest == 0 {
            // Release order contains all our previous shared accesses.
            ts.domain.intervals[ts.idx as usize].store(INFINITE, Ordering::Release);
            ts.interval = INFINITE;
        }
    });
}

/// Announce a quiescent state: the thread holds no references from before
/// this point. Must not be called while references are still held.
pub fn quiescent() {
    with_ts(|ts| {
        let interval = ts.domain.current.load(Ordering::Relaxed);
        if interval != ts.interval {
            // Release order contains all our previous shared accesses.
            ts.domain.intervals[ts.idx as usize].store(interval, Ordering::Release);
            ts.interval = interval;
            fence(Ordering::SeqCst);
        }
    });
}

/// Retire an object: `cb(ptr)` runs once every thread has observed an
/// interval later than the current one.
///
/// Returns `false` when the retire list stays full after a reclamation
/// pass.
///
/// # Safety
///
/// `ptr` must be unreachable for new readers, and `cb` safe to invoke on it
/// exactly once.
pub unsafe fn retire(ptr: *mut (), cb: unsafe fn(*mut ())) -> bool {
    with_ts(|ts| {
        if ts.objs.len() >= ts.domain.maxobjs as usize && sweep(ts) >= ts.domain.maxobjs as usize {
            return false;
        }
        // Create a new interval; the retired object belongs to the previous
        // one. Release order makes the removal observable before the new
        // interval is.
        let interval = ts.domain.current.fetch_add(1, Ordering::Release);
        ts.objs.push(Retired { ptr, cb, interval });
        true
    })
}

/// Force a reclamation pass; returns the number of objects still pending.
pub fn reclaim() -> usize {
    TS.with(|cell| {
        let mut borrow = cell.borrow_mut();
        match borrow.as_mut() {
            Some(ts) if !ts.objs.is_empty() => sweep(ts),
            _ => 0,
        }
    })
}

fn sweep(ts: &mut ThreadState) -> usize {
    let min = ts.domain.min_interval();
    ts.objs.retain(|obj| {
        if min > obj.interval {
            // Every thread has observed a later interval, no references
            // remain.
            unsafe { (obj.cb)(obj.ptr) };
            false
        } else {
            true
        }
    });
    ts.objs.len()
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static DROPPED: AtomicU32 = AtomicU32::new(0);

    unsafe fn count_drop(p: *mut ()) {
        DROPPED.fetch_add(1, Ordering::Relaxed);
        drop(unsafe { Box::from_raw(p as *mut u64) });
    }

    #[test]
    fn retire_waits_for_quiescence() {
        let dom = QsbrDomain::new(16).unwrap();
        register(&dom);

        acquire();
        let obj = Box::into_raw(Box::new(11u64));
        assert!(unsafe { retire(obj as *mut (), count_drop) });

        // We are still inside the read-side region: our own interval pins
        // the object.
        let before = DROPPED.load(Ordering::Relaxed);
        assert_eq!(reclaim(), 1);
        assert_eq!(DROPPED.load(Ordering::Relaxed), before);

        release();
        assert_eq!(reclaim(), 0);
        assert_eq!(DROPPED.load(Ordering::Relaxed), before + 1);

        assert!(unregister());
    }

    #[test]
    fn nested_regions() {
        let dom = QsbrDomain::new(16).unwrap();
        register(&dom);
        acquire();
        acquire();
        let obj = Box::into_raw(Box::new(5u64));
        assert!(unsafe { retire(obj as *mut (), count_drop) });
        release();
        // Still nested: not yet reclaimable.
        assert_eq!(reclaim(), 1);
        release();
        assert_eq!(reclaim(), 0);
        assert!(unregister());
    }

    #[test]
    fn quiescent_advances() {
        let dom = QsbrDomain::new(16).unwrap();
        register(&dom);
        acquire();
        release();
        let obj = Box::into_raw(Box::new(9u64));
        unsafe { retire(obj as *mut (), count_drop) };
        quiescent();
        assert_eq!(reclaim(), 0);
        assert!(unregister());
    }
}
