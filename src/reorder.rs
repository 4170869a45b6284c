/*!
Reorder buffer: restores sequence order across parallel processing.

Producers [`ReorderBuffer::acquire`] a span of sequence numbers, process
their elements in any order and [`ReorderBuffer::release`] them. Elements
released out of order park in the ring; the releaser that completes the
in-order span drains every consecutive element through the callback and
finishes each drained run with a `None` flush marker.

A slot can be released with [`ReorderBuffer::DUMMY`] to consume a sequence
number without invoking the callback.
*/

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::errhnd;
use crate::utils::{doze, roundup_pow2, CachePadded};

#[inline]
fn head_of(hi: u64) -> u32 {
    hi as u32
}

#[inline]
fn chgi_of(hi: u64) -> u32 {
    (hi >> 32) as u32
}

#[inline]
fn pack(head: u32, chgi: u32) -> u64 {
    ((chgi as u64) << 32) | head as u64
}

#[inline]
fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
fn after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Callback invoked for each in-order element; `None` flushes a drained
/// run ending at the given sequence number.
pub type ReorderCb<T> = Box<dyn Fn(Option<NonNull<T>>, u32) + Send + Sync>;

/// Reorder buffer over elements of type `T`.
pub struct ReorderBuffer<T> {
    /// First missing sequence number plus a change indicator.
    hi: CachePadded<AtomicU64>,
    mask: u32,
    user_acquire: bool,
    cb: ReorderCb<T>,
    tail: CachePadded<AtomicU32>,
    ring: Box<[AtomicUsize]>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for ReorderBuffer<T> {}
unsafe impl<T> Sync for ReorderBuffer<T> {}

impl<T> ReorderBuffer<T> {
    /// Sentinel consuming a sequence number without a callback.
    pub const DUMMY: usize = 1;

    /// Allocate a reorder buffer of at least `nelems` in-flight elements.
    /// With `user_acquire` the caller manages sequence numbers itself and
    /// out-of-window releases block instead of failing.
    pub fn new(nelems: u32, user_acquire: bool, cb: ReorderCb<T>) -> Option<Self> {
        if nelems == 0 || nelems > 0x8000_0000 {
            errhnd::report("reorder", "invalid reorder buffer size", nelems as usize);
            return None;
        }
        let ringsize = roundup_pow2(nelems as usize);
        Some(Self {
            hi: CachePadded::new(AtomicU64::new(0)),
            mask: (ringsize - 1) as u32,
            user_acquire,
            cb,
            tail: CachePadded::new(AtomicU32::new(0)),
            ring: (0..ringsize).map(|_| AtomicUsize::new(0)).collect(),
            _marker: PhantomData,
        })
    }

    /// Acquire up to `requested` consecutive sequence numbers; the first
    /// one is written to `sn`. Returns 0 when the window is full.
    pub fn acquire(&self, requested: u32, sn: &mut u32) -> u32 {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let head = head_of(self.hi.load(Ordering::Acquire));
            // Signed arithmetic: head and tail are not read atomically
            // together, so available may transiently be negative.
            let available = (self.mask + 1) as i32 - tail.wrapping_sub(head) as i32;
            let actual = available.min(requested as i32);
            if actual <= 0 {
                return 0;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(actual as u32),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    *sn = tail;
                    return actual as u32;
                }
                Err(cur) => tail = cur,
            }
        }
    }

    /// Release `elems` at sequence number `sn`. Pass [`Self::DUMMY`] cast
    /// to an element pointer to skip a slot.
    ///
    /// # Safety
    ///
    /// The sequence numbers `[sn, sn + elems.len())` must have been
    /// acquired and not yet released; elements must stay valid until the
    /// callback has consumed them.
    pub unsafe fn release(&self, sn: u32, elems: &[*mut T]) {
        let mask = self.mask;
        let nelems = elems.len() as u32;
        if self.user_acquire {
            // The user may have been generous with sequence numbers; wait
            // until ours fits inside the window.
            let sz = mask + 1;
            while after(
                sn.wrapping_add(nelems),
                head_of(self.hi.load(Ordering::Acquire)).wrapping_add(sz),
            ) {
                doze();
            }
        } else if after(sn.wrapping_add(nelems), self.tail.load(Ordering::Relaxed)) {
            errhnd::report("reorder", "invalid sequence number", sn as usize);
            return;
        }
        // Park our elements in the ring, releasing them.
        fence(Ordering::Release);
        for (i, e) in elems.iter().enumerate() {
            if (*e as usize) == 0 {
                errhnd::report("reorder", "invalid null element", sn as usize);
                return;
            }
            let slot = &self.ring[(sn.wrapping_add(i as u32) & mask) as usize];
            debug_assert_eq!(slot.load(Ordering::Relaxed), 0);
            slot.store(*e as usize, Ordering::Relaxed);
        }

        let mut old = self.hi.load(Ordering::Acquire);
        while before(head_of(old), sn) || !before(head_of(old), sn.wrapping_add(nelems)) {
            // We are out of order: just mark that new elements exist.
            let new = pack(head_of(old), chgi_of(old).wrapping_add(1));
            match self
                .hi
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Acquire)
            {
                // Head unchanged, still out of order: done for now.
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }

        // We are in order: it is our responsibility to drain every
        // consecutive parked element.
        let mut head = head_of(old);
        loop {
            let mut npending = 0u32;
            loop {
                let elem = self.ring[(head & mask) as usize].load(Ordering::Acquire);
                if elem == 0 {
                    break;
                }
                self.ring[(head & mask) as usize].store(0, Ordering::Relaxed);
                if elem > Self::DUMMY {
                    (self.cb)(NonNull::new(elem as *mut T), head);
                    npending += 1;
                }
                head = head.wrapping_add(1);
            }
            debug_assert_ne!(head, head_of(old));
            if npending != 0 {
                // Flush the drained run.
                (self.cb)(None, head);
            }
            let new = pack(head, chgi_of(old));
            match self
                .hi
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                // The change indicator moved: more elements were parked
                // behind our head; keep draining from where we stopped.
                Err(cur) => old = cur,
            }
        }
    }
}

impl<T> Drop for ReorderBuffer<T> {
    fn drop(&mut self) {
        if !self.user_acquire
            && head_of(self.hi.load(Ordering::Relaxed)) != self.tail.load(Ordering::Relaxed)
        {
            errhnd::report("reorder", "reorder buffer not empty", 0);
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn out_of_order_release_restores_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let rob: ReorderBuffer<u64> = ReorderBuffer::new(
            8,
            false,
            Box::new(move |elem, sn| {
                if let Some(e) = elem {
                    seen2.lock().unwrap().push((e.as_ptr() as usize, sn));
                }
            }),
        )
        .unwrap();

        let mut sn = 0;
        assert_eq!(rob.acquire(3, &mut sn), 3);
        assert_eq!(sn, 0);
        // Release 2, then 1, then 0: the callback order must be 0, 1, 2.
        unsafe {
            rob.release(2, &[0x300 as *mut u64]);
            rob.release(1, &[0x200 as *mut u64]);
            rob.release(0, &[0x100 as *mut u64]);
        }
        let got = seen.lock().unwrap().clone();
        assert_eq!(got, vec![(0x100, 0), (0x200, 1), (0x300, 2)]);
    }

    #[test]
    fn dummy_skips_callback() {
        let count = Arc::new(Mutex::new(0));
        let count2 = Arc::clone(&count);
        let rob: ReorderBuffer<u64> = ReorderBuffer::new(
            4,
            false,
            Box::new(move |elem, _| {
                if elem.is_some() {
                    *count2.lock().unwrap() += 1;
                }
            }),
        )
        .unwrap();
        let mut sn = 0;
        assert_eq!(rob.acquire(2, &mut sn), 2);
        unsafe {
            rob.release(0, &[ReorderBuffer::<u64>::DUMMY as *mut u64]);
            rob.release(1, &[0x100 as *mut u64]);
        }
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn window_limits_acquisition() {
        let rob: ReorderBuffer<u64> =
            ReorderBuffer::new(4, false, Box::new(|_, _| {})).unwrap();
        let mut sn = 0;
        assert_eq!(rob.acquire(4, &mut sn), 4);
        let mut sn2 = 0;
        assert_eq!(rob.acquire(1, &mut sn2), 0);
        unsafe {
            rob.release(0, &[0x100 as *mut u64, 0x200 as *mut u64]);
        }
        assert_eq!(rob.acquire(8, &mut sn2), 2);
        unsafe {
            rob.release(2, &[0x100 as *mut u64, 0x200 as *mut u64]);
            rob.release(4, &[0x100 as *mut u64, 0x200 as *mut u64]);
        }
    }
}
