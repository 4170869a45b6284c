/*!
Lock-free ring buffer.

Every slot is a `(ptr, idx)` pair updated with a 128-bit CAS; the stored
index identifies the lap a slot was last written in, so producers can claim
slots without coordinating and a stalled producer only delays its own
element. Single-producer and single-consumer fast paths are selectable per
side.
*/

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use portable_atomic::AtomicU128;

use crate::errhnd;
use crate::utils::{roundup_pow2, CachePadded};

/// Per-side mode: single (fast path) or lock-free multi.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Multi,
}

#[inline]
fn ptr_of(word: u128) -> usize {
    word as u64 as usize
}

#[inline]
fn idx_of(word: u128) -> usize {
    (word >> 64) as u64 as usize
}

#[inline]
fn pack(ptr: usize, idx: usize) -> u128 {
    ((idx as u64 as u128) << 64) | ptr as u64 as u128
}

/// True if `a` is before `b` in serial number arithmetic.
#[inline]
fn before(a: usize, b: usize) -> bool {
    (a.wrapping_sub(b) as isize) < 0
}

/// Lock-free MPMC ring of `NonNull<T>` element pointers.
pub struct LfRing<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    penq: Mode,
    cdeq: Mode,
    ring: Box<[AtomicU128]>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for LfRing<T> {}
unsafe impl<T> Sync for LfRing<T> {}

impl<T> LfRing<T> {
    pub fn new(nelems: u32, penq: Mode, cdeq: Mode) -> Option<Self> {
        if nelems == 0 || nelems > 0x8000_0000 {
            errhnd::report("lfring", "invalid number of elements", nelems as usize);
            return None;
        }
        let ringsz = roundup_pow2(nelems as usize);
        let ring = (0..ringsz)
            // idx starts one lap back so slot i is writable at index i.
            .map(|i| AtomicU128::new(pack(0, i.wrapping_sub(ringsz))))
            .collect();
        Some(Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: ringsz - 1,
            penq,
            cdeq,
            ring,
            _marker: PhantomData,
        })
    }

    /// Move `loc` forward to `new` unless it is already past it.
    fn cond_update(loc: &AtomicUsize, new: usize) {
        let mut old = loc.load(Ordering::Relaxed);
        loop {
            if before(new, old) {
                return;
            }
            match loc.compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }
    }

    /// Catch up with a fresher cursor, or step to the next slot.
    fn cond_reload(idx: usize, loc: &AtomicUsize) -> usize {
        let fresh = loc.load(Ordering::Relaxed);
        if before(idx, fresh) {
            fresh
        } else {
            idx.wrapping_add(1)
        }
    }

    /// Enqueue a batch at the tail; returns how many were enqueued.
    pub fn enqueue(&self, elems: &[NonNull<T>]) -> usize {
        let size = self.mask + 1;
        let mut tail = self.tail.load(Ordering::Relaxed);
        if self.penq == Mode::Single {
            let head = self.head.load(Ordering::Acquire);
            let actual =
                (elems.len() as isize).min(head.wrapping_add(size).wrapping_sub(tail) as isize);
            if actual <= 0 {
                return 0;
            }
            for e in &elems[..actual as usize] {
                self.ring[tail & self.mask]
                    .store(pack(e.as_ptr() as usize, tail), Ordering::Release);
                tail = tail.wrapping_add(1);
            }
            self.tail.store(tail, Ordering::Release);
            return actual as usize;
        }
        // Lock-free multi-producer.
        let mut actual = 0usize;
        'restart: while actual < elems.len()
            && before(tail, self.head.load(Ordering::Acquire).wrapping_add(size))
        {
            let slot = &self.ring[tail & self.mask];
            let mut old = slot.load(Ordering::Relaxed);
            loop {
                if idx_of(old) != tail.wrapping_sub(size) {
                    if idx_of(old) != tail {
                        // Far behind: restart with a fresh index.
                        tail = Self::cond_reload(tail, &self.tail);
                    } else {
                        // Slot already enqueued this lap; try the next.
                        tail = tail.wrapping_add(1);
                    }
                    continue 'restart;
                }
                // Slot was last used one lap back: claim it.
                let new = pack(elems[actual].as_ptr() as usize, tail);
                match slot.compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
                {
                    Ok(_) => break,
                    Err(cur) => old = cur,
                }
            }
            actual += 1;
            tail = tail.wrapping_add(1);
        }
        Self::cond_update(&self.tail, tail);
        actual
    }

    /// Dequeue a batch from the head; returns the count and the ring index
    /// of the first element.
    pub fn dequeue(&self, elems: &mut [*mut T]) -> (usize, u32) {
        let mut head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        loop {
            let actual = (elems.len() as isize).min(tail.wrapping_sub(head) as isize);
            if actual <= 0 {
                return (0, 0);
            }
            for i in 0..actual as usize {
                let word = self.ring[head.wrapping_add(i) & self.mask].load(Ordering::Acquire);
                elems[i] = ptr_of(word) as *mut T;
            }
            if self.cdeq == Mode::Single {
                self.head
                    .store(head.wrapping_add(actual as usize), Ordering::Release);
                return (actual as usize, head as u32);
            }
            match self.head.compare_exchange(
                head,
                head.wrapping_add(actual as usize),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return (actual as usize, head as u32),
                Err(cur) => head = cur,
            }
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(v: usize) -> NonNull<u64> {
        NonNull::new((v * 8) as *mut u64).unwrap()
    }

    #[test]
    fn sp_sc() {
        let ring: LfRing<u64> = LfRing::new(4, Mode::Single, Mode::Single).unwrap();
        assert_eq!(ring.enqueue(&[mk(1), mk(2), mk(3), mk(4), mk(5)]), 4);
        let mut out = [std::ptr::null_mut(); 8];
        let (n, idx) = ring.dequeue(&mut out);
        assert_eq!((n, idx), (4, 0));
        assert_eq!(out[0] as usize / 8, 1);
        assert_eq!(out[3] as usize / 8, 4);
    }

    #[test]
    fn mp_mc_no_loss() {
        let ring: LfRing<u64> = LfRing::new(32, Mode::Multi, Mode::Multi).unwrap();
        let total = AtomicUsize::new(0);
        let consumed = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for t in 0..2usize {
                let ring = &ring;
                s.spawn(move || {
                    for i in 0..500 {
                        let e = mk(1 + t * 1000 + i);
                        while ring.enqueue(&[e]) == 0 {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    let mut out = [std::ptr::null_mut(); 4];
                    while consumed.load(Ordering::Relaxed) < 1000 {
                        let (n, _) = ring.dequeue(&mut out);
                        if n == 0 {
                            std::thread::yield_now();
                            continue;
                        }
                        let sum: usize = out[..n].iter().map(|p| *p as usize / 8).sum();
                        total.fetch_add(sum, Ordering::Relaxed);
                        consumed.fetch_add(n, Ordering::Relaxed);
                    }
                });
            }
        });
        let expect: usize = (1..=500).sum::<usize>() + (1001..=1500).sum::<usize>();
        assert_eq!(total.load(Ordering::Relaxed), expect);
    }
}
