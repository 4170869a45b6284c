/*!
Safe memory reclamation with hazard pointers.

A [`HpDomain`] is the process-wide configuration of one reclamation scheme:
`nrefs` hazard slots per thread and room for `maxobjs` retired objects per
thread. A thread binds itself to a domain with [`register`] and from then on
uses the module-level operations, which act on the calling thread's state
(the same shape as a thread-local allocator).

The contract: a retired object is reclaimed only when no thread's published
hazard slot holds its address. [`acquire`] publishes the loaded pointer with
sequential consistency and re-reads the source until the two agree, so a
reader can dereference the result until it releases the hazard.

Pointer values below the cache-line size are treated as NULL; this lets
containers keep tag bits in the low bits of otherwise-null words.

# Example

```
use std::sync::atomic::AtomicPtr;
use manycore::hazptr::{self, Hazard, HpDomain};

let dom = HpDomain::new(64, 4).unwrap();
hazptr::register(&dom);

let shared = AtomicPtr::new(Box::into_raw(Box::new(42u32)));
let mut hp = Hazard::null();
let p = hazptr::acquire(&shared, &mut hp);
assert_eq!(unsafe { *p }, 42);
hazptr::release(&mut hp);

// Hand the object to the domain instead of freeing it in place.
unsafe fn drop_u32(p: *mut ()) {
    drop(unsafe { Box::from_raw(p as *mut u32) });
}
let old = shared.swap(std::ptr::null_mut(), std::sync::atomic::Ordering::AcqRel);
assert!(unsafe { hazptr::retire(old as *mut (), drop_u32) });
hazptr::reclaim();
hazptr::unregister();
```
*/

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errhnd;
use crate::tidx;
use crate::{CACHE_LINE, MAX_THREADS};

// Pointers into the zeroth cache line are treated as NULL pointers.
const NULL_RANGE: usize = CACHE_LINE;

#[inline]
fn is_null_ptr(val: usize) -> bool {
    val < NULL_RANGE
}

// -------------------------------------

/// Hazard-pointer domain.
///
/// Holds the published slot arrays of every registered thread. Per-thread
/// slot arrays are allocated at first registration of a thread index and
/// stay owned by the domain until it drops, so a concurrent scan never
/// observes freed slot memory.
pub struct HpDomain {
    nrefs: u32,
    maxobjs: u32,
    high_wm: AtomicU32,
    /// Published slot array per thread index; null while inactive.
    active: Box<[AtomicPtr<AtomicUsize>]>,
    /// Owning pointers, reused across re-registration of an index.
    arrays: Box<[AtomicPtr<AtomicUsize>]>,
}

unsafe impl Send for HpDomain {}
unsafe impl Sync for HpDomain {}

impl HpDomain {
    /// Create a domain with up to `maxobjs` pending retired objects and
    /// `nrefs` hazard slots per thread. `1 <= nrefs <= 32`.
    ///
    /// `maxobjs` should leave at least one retire per thread beyond the
    /// expected number of concurrently held references, or [`retire`] may
    /// report exhaustion under load.
    pub fn new(maxobjs: u32, nrefs: u32) -> Option<Arc<Self>> {
        if !(1..=32).contains(&nrefs) {
            errhnd::report("hazardptr", "invalid number of references", nrefs as usize);
            return None;
        }
        if maxobjs == 0 {
            errhnd::report("hazardptr", "invalid number of objects", maxobjs as usize);
            return None;
        }
        let active = (0..MAX_THREADS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let arrays = (0..MAX_THREADS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Some(Arc::new(Self {
            nrefs,
            maxobjs,
            high_wm: AtomicU32::new(0),
            active,
            arrays,
        }))
    }

    /// Slot array for a thread index, allocating it on first use.
    fn slots_for(&self, idx: u32) -> *mut AtomicUsize {
        let slot = &self.arrays[idx as usize];
        let cur = slot.load(Ordering::Acquire);
        if !cur.is_null() {
            return cur;
        }
        let vec: Box<[AtomicUsize]> = (0..self.nrefs).map(|_| AtomicUsize::new(0)).collect();
        let raw = Box::into_raw(vec) as *mut AtomicUsize;
        // The index is exclusively ours while registered, no race here.
        slot.store(raw, Ordering::Release);
        raw
    }
}

impl Drop for HpDomain {
    fn drop(&mut self) {
        let nthreads = self.high_wm.load(Ordering::Acquire);
        for t in 0..nthreads as usize {
            if !self.active[t].load(Ordering::Relaxed).is_null() {
                errhnd::report("hazardptr", "registered threads still present", t);
                return;
            }
        }
        for slot in self.arrays.iter() {
            let raw = slot.load(Ordering::Relaxed);
            if !raw.is_null() {
                let slice = ptr::slice_from_raw_parts_mut(raw, self.nrefs as usize);
                drop(unsafe { Box::from_raw(slice) });
            }
        }
    }
}

// -------------------------------------

struct Retired {
    ptr: *mut (),
    cb: unsafe fn(*mut ()),
}

struct ThreadState {
    domain: Arc<HpDomain>,
    idx: u32,
    /// Bitmask of free hazard slots.
    free: u32,
    nrefs: u32,
    slots: *mut AtomicUsize,
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
                errhnd::report("hazardptr", "thread not registered", 0);
                panic!("hazardptr: thread not registered");
            }
        }
    })
}

/// Register the calling thread with a domain.
///
/// Registering again with the same domain reactivates the thread. A thread
/// may be registered with at most one hazard-pointer domain at a time.
pub fn register(domain: &Arc<HpDomain>) {
    let bound = TS.with(|cell| {
        let mut borrow = cell.borrow_mut();
        if let Some(ts) = borrow.as_ref() {
            if !Arc::ptr_eq(&ts.domain, domain) {
                errhnd::report("hazardptr", "already registered with other domain", 0);
                return false;
            }
            true
        } else {
            let Some(idx) = tidx::alloc() else {
                errhnd::report("hazardptr", "too many registered threads", MAX_THREADS);
                return false;
            };
            let slots = domain.slots_for(idx);
            // The array may be inherited from an earlier occupant of this
            // index; stale hazards must not pin anything.
            for i in 0..domain.nrefs as usize {
                unsafe { &*slots.add(i) }.store(0, Ordering::Relaxed);
            }
            domain.high_wm.fetch_max(idx + 1, Ordering::Relaxed);
            *borrow = Some(ThreadState {
                domain: Arc::clone(domain),
                idx,
                free: if domain.nrefs < 32 {
                    (1u32 << domain.nrefs) - 1
                } else {
                    !0
                },
                nrefs: domain.nrefs,
                slots,
                objs: Vec::with_capacity(domain.maxobjs as usize),
            });
            true
        }
    });
    if bound {
        activate();
    }
}

/// Unregister the calling thread. Fails (reporting an error) when retired
/// objects are still pending.
pub fn unregister() -> bool {
    TS.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let Some(ts) = borrow.as_mut() else {
            errhnd::report("hazardptr", "thread not registered", 0);
            return false;
        };
        if !ts.objs.is_empty() {
            errhnd::report("hazardptr", "thread has unreclaimed objects", ts.objs.len());
            return false;
        }
        ts.domain.active[ts.idx as usize].store(ptr::null_mut(), Ordering::Release);
        tidx::free(ts.idx);
        *borrow = None;
        true
    })
}

/// Mark the thread active again: its hazard slots must be observed by
/// reclaimers before any of its reads are observed.
pub fn activate() {
    with_ts(|ts| {
        ts.domain.active[ts.idx as usize].store(ts.slots, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    });
}

/// Mark the thread inactive: it holds no references and reclaimers may
/// ignore it. Useful before blocking for a long time.
pub fn deactivate() {
    with_ts(|ts| {
        ts.domain.active[ts.idx as usize].store(ptr::null_mut(), Ordering::Release);
    });
}

// -------------------------------------

/// Handle to one allocated hazard slot of the calling thread.
///
/// A null handle owns no slot; [`acquire`] allocates one on demand and
/// [`release`] returns it to the per-thread pool.
pub struct Hazard {
    slot: *mut AtomicUsize,
}

impl Hazard {
    pub const fn null() -> Self {
        Self {
            slot: ptr::null_mut(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.slot.is_null()
    }
}

impl Default for Hazard {
    fn default() -> Self {
        Self::null()
    }
}

fn slot_alloc(ts: &mut ThreadState) -> *mut AtomicUsize {
    if ts.free != 0 {
        let idx = ts.free.trailing_zeros();
        ts.free &= !(1 << idx);
        unsafe { ts.slots.add(idx as usize) }
    } else {
        errhnd::report("hazardptr", "out of hazard pointers", ts.nrefs as usize);
        ptr::null_mut()
    }
}

fn slot_free(ts: &mut ThreadState, slot: *mut AtomicUsize) {
    let idx = unsafe { slot.offset_from(ts.slots) };
    if idx < 0 || idx as u32 >= ts.nrefs {
        errhnd::report("hazardptr", "invalid hazard pointer", slot as usize);
        return;
    }
    debug_assert!(ts.free & (1u32 << idx) == 0);
    ts.free |= 1u32 << idx;
}

/// Core publish/verify loop shared by all acquire flavours. `load` performs
/// a relaxed read of the source location; the value stored in the hazard
/// slot and used for the verify compare is `load() & mask`.
fn acquire_loop(hp: &mut Hazard, mask: usize, load: &dyn Fn(Ordering) -> usize) -> usize {
    with_ts(|ts| {
        if !hp.slot.is_null() {
            // Release any pending stores before the reference is abandoned.
            unsafe { &*hp.slot }.store(0, Ordering::Release);
        }
        loop {
            // Step 1: read the location.
            let val = load(Ordering::Relaxed);
            if is_null_ptr(val & mask) {
                // *hp may still hold an allocated (cleared) slot.
                return val;
            }
            // Step 2: allocate a hazard slot if necessary, then publish.
            if hp.slot.is_null() {
                hp.slot = slot_alloc(ts);
                if hp.slot.is_null() {
                    return 0;
                }
            }
            unsafe { &*hp.slot }.store(val & mask, Ordering::SeqCst);
            // Step 3: verify by re-reading; sequential consistency keeps the
            // store and this load ordered.
            if load(Ordering::SeqCst) & mask == val & mask {
                return val;
            }
            // Step 4: lost the race, reset and restart.
            unsafe { &*hp.slot }.store(0, Ordering::Relaxed);
        }
    })
}

/// Safely acquire a reference to the object `*loc` points to.
///
/// Publishes the loaded pointer in a hazard slot (allocating one into `hp`
/// if needed) and returns it; NULL-range pointers are returned without
/// consuming a slot. The object stays safe from reclamation until the
/// hazard is released or re-used.
pub fn acquire<T>(loc: &AtomicPtr<T>, hp: &mut Hazard) -> *mut T {
    acquire_loop(hp, !0, &|mo| loc.load(mo) as usize) as *mut T
}

/// Like [`acquire`], but the hazard slot holds `loaded & mask` and the
/// verify compare uses the masked value. Lets callers keep tag bits in the
/// low bits of the pointer.
pub fn acquire_mask<T>(loc: &AtomicPtr<T>, hp: &mut Hazard, mask: usize) -> *mut T {
    acquire_loop(hp, mask, &|mo| loc.load(mo) as usize) as *mut T
}

/// Acquire through an arbitrary load of a word containing a pointer; used
/// by containers whose pointers live inside wider atomics. `load` must
/// re-read the same location every call.
pub fn acquire_with(hp: &mut Hazard, mask: usize, load: impl Fn(Ordering) -> usize) -> usize {
    acquire_loop(hp, mask, &load)
}

/// Release the reference; updates may have been made through it.
pub fn release(hp: &mut Hazard) {
    if !hp.slot.is_null() {
        with_ts(|ts| {
            unsafe { &*hp.slot }.store(0, Ordering::Release);
            slot_free(ts, hp.slot);
        });
        hp.slot = ptr::null_mut();
    }
}

/// Release the reference after read-only use; only loads are ordered.
pub fn release_ro(hp: &mut Hazard) {
    if !hp.slot.is_null() {
        with_ts(|ts| {
            // Load-only barrier.
            fence(Ordering::Acquire);
            unsafe { &*hp.slot }.store(0, Ordering::Relaxed);
            slot_free(ts, hp.slot);
        });
        hp.slot = ptr::null_mut();
    }
}

// -------------------------------------

/// Retire an object: `cb(ptr)` runs once no thread holds a hazard on `ptr`.
///
/// Returns `false` when the retire list is full even after a reclamation
/// pass (the one recoverable resource-exhaustion case).
///
/// # Safety
///
/// `ptr` must not be reachable for new readers any more, and `cb` must be
/// safe to call on it exactly once. `cb` must not call back into this
/// domain.
pub unsafe fn retire(ptr: *mut (), cb: unsafe fn(*mut ())) -> bool {
    with_ts(|ts| {
        if ts.objs.len() >= ts.domain.maxobjs as usize {
            // Ensure all removals are visible before we read hazard slots.
            fence(Ordering::SeqCst);
            garbage_collect(ts);
            if ts.objs.len() >= ts.domain.maxobjs as usize {
                return false;
            }
        }
        ts.objs.push(Retired { ptr, cb });
        if ts.objs.len() == ts.domain.maxobjs as usize {
            fence(Ordering::SeqCst);
            garbage_collect(ts);
        }
        true
    })
}

/// Force a reclamation pass; returns the number of objects still pending.
pub fn reclaim() -> usize {
    with_ts(|ts| {
        if ts.objs.is_empty() {
            return 0;
        }
        fence(Ordering::SeqCst);
        garbage_collect(ts)
    })
}

/// Scan every active thread's published hazards, then sweep the local
/// retire list reclaiming everything unreferenced.
fn garbage_collect(ts: &mut ThreadState) -> usize {
    let domain = &ts.domain;
    let nthreads = domain.high_wm.load(Ordering::Acquire) as usize;
    let mut refs = Vec::with_capacity(nthreads * domain.nrefs as usize);
    for t in 0..nthreads {
        let slots = domain.active[t].load(Ordering::Acquire);
        if slots.is_null() {
            // Inactive thread, holds no references.
            continue;
        }
        for i in 0..domain.nrefs as usize {
            let val = unsafe { &*slots.add(i) }.load(Ordering::Relaxed);
            if !is_null_ptr(val) {
                refs.push(val);
            }
        }
    }
    refs.sort_unstable();
    ts.objs.retain(|obj| {
        if refs.binary_search(&(obj.ptr as usize)).is_ok() {
            // Still referenced, keep it pending.
            true
        } else {
            unsafe { (obj.cb)(obj.ptr) };
            false
        }
    });
    ts.objs.len()
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdU32;

    static DROPPED: StdU32 = StdU32::new(0);

    unsafe fn count_drop(p: *mut ()) {
        DROPPED.fetch_add(1, Ordering::Relaxed);
        drop(unsafe { Box::from_raw(p as *mut u64) });
    }

    #[test]
    fn acquire_protects_from_reclaim() {
        let dom = HpDomain::new(16, 4).unwrap();
        register(&dom);

        let shared = AtomicPtr::new(Box::into_raw(Box::new(7u64)));
        let mut hp = Hazard::null();
        let p = acquire(&shared, &mut hp);
        assert_eq!(unsafe { *p }, 7);

        let before = DROPPED.load(Ordering::Relaxed);
        let old = shared.swap(ptr::null_mut(), Ordering::AcqRel);
        assert!(unsafe { retire(old as *mut (), count_drop) });

        // Our own hazard still points at the object, it must survive.
        assert_eq!(reclaim(), 1);
        assert_eq!(DROPPED.load(Ordering::Relaxed), before);

        release(&mut hp);
        assert_eq!(reclaim(), 0);
        assert_eq!(DROPPED.load(Ordering::Relaxed), before + 1);

        assert!(unregister());
    }

    #[test]
    fn null_range_is_null() {
        let dom = HpDomain::new(16, 2).unwrap();
        register(&dom);
        // Low-tagged values are returned without taking a slot.
        let shared = AtomicPtr::new(3usize as *mut u64);
        let mut hp = Hazard::null();
        let p = acquire(&shared, &mut hp);
        assert_eq!(p as usize, 3);
        assert!(hp.is_null());
        assert!(unregister());
    }

    #[test]
    fn release_ro_frees_slot() {
        let dom = HpDomain::new(16, 1).unwrap();
        register(&dom);
        let shared = AtomicPtr::new(Box::into_raw(Box::new(1u64)));
        let mut hp = Hazard::null();
        // With a single slot per thread, re-acquire only works if release
        // actually returns the slot.
        for _ in 0..3 {
            let p = acquire(&shared, &mut hp);
            assert!(!p.is_null());
            release_ro(&mut hp);
        }
        let p = shared.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(p) });
        assert!(unregister());
    }
}
