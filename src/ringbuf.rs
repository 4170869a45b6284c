/*!
Classic bounded ring buffer with head/tail metadata split onto distinct
cache lines and per-side modes chosen at construction:

- [`Producer::Single`] / [`Consumer::Single`]: MT-unsafe fast path, one
  thread per side.
- [`Producer::MultiBlocking`] / [`Consumer::MultiBlocking`]: releases wait
  for their predecessor to advance the shared counter.
- [`Producer::MultiNonBlocking`] / [`Consumer::MultiNonBlocking`]: a
  release sets its bit in a 32-slot pending mask; any trailing run of ones
  is folded into the public counter with a CAS, so release order is
  independent of acquire order.
- [`Consumer::LockFree`]: speculative read then CAS of the head; a stalled
  producer never blocks consumers of already-released elements.

Elements are `Copy` values (typically pointers).
*/

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::errhnd;
use crate::utils::{doze, roundup_pow2, Backoff, CachePadded};

/// Producer-side mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    Single,
    MultiBlocking,
    MultiNonBlocking,
}

/// Consumer-side mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumer {
    Single,
    MultiBlocking,
    MultiNonBlocking,
    LockFree,
}

/// Width of the pending window for the non-blocking release modes.
const PENDMAX: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /// Single producer/consumer: plain publish.
    Plain,
    /// Wait for the predecessor, then publish.
    Blocking,
    /// Fold through the pending mask.
    NonBlocking,
}

impl From<Producer> for Release {
    fn from(p: Producer) -> Self {
        match p {
            Producer::Single => Release::Plain,
            Producer::MultiBlocking => Release::Blocking,
            Producer::MultiNonBlocking => Release::NonBlocking,
        }
    }
}

impl From<Consumer> for Release {
    fn from(c: Consumer) -> Self {
        match c {
            Consumer::Single => Release::Plain,
            Consumer::MultiBlocking => Release::Blocking,
            Consumer::MultiNonBlocking => Release::NonBlocking,
            Consumer::LockFree => Release::Plain,
        }
    }
}

#[inline]
fn cur_of(word: u64) -> u32 {
    word as u32
}

#[inline]
fn pend_of(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
fn pack(cur: u32, pend: u32) -> u64 {
    ((pend as u64) << 32) | cur as u64
}

/// One endpoint: the public release point `(cur, pend)` plus the private
/// acquire cursor for the multi modes.
struct End {
    limit: AtomicU64,
    cursor: AtomicU32,
    capacity: u32,
}

struct Taken {
    index: u32,
    actual: u32,
}

/// Bounded MPMC ring buffer of `Copy` elements.
pub struct RingBuf<T: Copy> {
    prod: CachePadded<End>,
    cons: CachePadded<End>,
    mask: u32,
    pmode: Producer,
    cmode: Consumer,
    ring: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Copy + Send> Send for RingBuf<T> {}
unsafe impl<T: Copy + Send> Sync for RingBuf<T> {}

impl<T: Copy> RingBuf<T> {
    /// Allocate a ring with room for at least `nelems` elements.
    pub fn new(nelems: u32, pmode: Producer, cmode: Consumer) -> Option<Self> {
        if nelems == 0 {
            errhnd::report("ringbuf", "invalid number of elements", 0);
            return None;
        }
        let ringsz = roundup_pow2(nelems as usize);
        let ring = (0..ringsz)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Some(Self {
            prod: CachePadded::new(End {
                limit: AtomicU64::new(0),
                cursor: AtomicU32::new(0),
                capacity: nelems,
            }),
            cons: CachePadded::new(End {
                limit: AtomicU64::new(0),
                cursor: AtomicU32::new(0),
                capacity: 0,
            }),
            mask: (ringsz - 1) as u32,
            pmode,
            cmode,
            ring,
        })
    }

    // MT-unsafe single producer/consumer acquisition: the cursor is the
    // other side's release point, which we alone advance.
    fn acquire_single(read: &AtomicU64, write: &AtomicU64, n: u32, capacity: u32) -> Taken {
        let tail = cur_of(write.load(Ordering::Relaxed));
        let head = cur_of(read.load(Ordering::Acquire));
        let actual = (n as i32).min(capacity.wrapping_add(head).wrapping_sub(tail) as i32);
        if actual <= 0 {
            return Taken { index: 0, actual: 0 };
        }
        Taken {
            index: tail,
            actual: actual as u32,
        }
    }

    // MT-safe acquisition for the multi modes.
    fn acquire_multi(read: &AtomicU64, end: &End, n: u32) -> Taken {
        let mut tail = end.cursor.load(Ordering::Relaxed);
        loop {
            let head = cur_of(read.load(Ordering::Acquire));
            let actual =
                (n as i32).min(end.capacity.wrapping_add(head).wrapping_sub(tail) as i32);
            if actual <= 0 {
                return Taken { index: 0, actual: 0 };
            }
            match end.cursor.compare_exchange_weak(
                tail,
                tail.wrapping_add(actual as u32),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Taken {
                        index: tail,
                        actual: actual as u32,
                    }
                }
                Err(cur) => tail = cur,
            }
        }
    }

    /// Publish `[idx, idx+n)` on `loc`, honouring the side's mode.
    fn release_slots(loc: &AtomicU64, idx: u32, n: u32, loads_only: bool, mode: Release) {
        if mode != Release::NonBlocking {
            if mode == Release::Blocking {
                // Wait for our turn to signal the other side.
                let mut backoff = Backoff::new();
                while cur_of(loc.load(Ordering::Relaxed)) != idx {
                    backoff.spin();
                }
            }
            if loads_only {
                fence(Ordering::Release);
                loc.store(pack(idx.wrapping_add(n), 0), Ordering::Relaxed);
            } else {
                loc.store(pack(idx.wrapping_add(n), 0), Ordering::Release);
            }
            return;
        }
        // Non-blocking: fold through the pending mask.
        let mut old;
        loop {
            // Attempt in-order release with a clear pending mask.
            match loc.compare_exchange(
                pack(idx, 0),
                pack(idx.wrapping_add(n), 0),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
            let delta = idx.wrapping_add(n).wrapping_sub(cur_of(old));
            if delta <= PENDMAX {
                break;
            }
            // Outside the pending window (or a too-large release, which
            // must complete in order); wait and try again.
            doze();
        }
        loop {
            debug_assert!(n < PENDMAX);
            let offset = idx.wrapping_sub(cur_of(old));
            debug_assert!(n + offset <= PENDMAX);
            let ourpend = ((1u32 << n) - 1) << offset;
            debug_assert_eq!(pend_of(old) & ourpend, 0);
            // The widened mask may shift by up to PENDMAX bits.
            let newpend = (pend_of(old) | ourpend) as u64;
            let inorder = (!newpend).trailing_zeros();
            debug_assert!(inorder <= PENDMAX);
            let new = pack(
                cur_of(old).wrapping_add(inorder),
                (newpend >> inorder) as u32,
            );
            debug_assert_eq!(pend_of(new) & 1, 0);
            match loc.compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }
    }

    #[inline]
    fn slot(&self, index: u32) -> *mut MaybeUninit<T> {
        self.ring[(index & self.mask) as usize].get()
    }

    fn write_slots(&self, ev: &[T], r: &Taken) {
        for (i, e) in ev[..r.actual as usize].iter().enumerate() {
            unsafe { (*self.slot(r.index.wrapping_add(i as u32))).write(*e) };
        }
    }

    fn read_slots(&self, ev: &mut [T], r: &Taken) {
        for i in 0..r.actual as usize {
            ev[i] = unsafe { (*self.slot(r.index.wrapping_add(i as u32))).assume_init_read() };
        }
    }

    /// Enqueue elements at the tail; returns how many from the front of
    /// `ev` were enqueued.
    pub fn enqueue(&self, ev: &[T]) -> usize {
        // Step 1: acquire slots.
        let r = match self.pmode {
            Producer::Single => Self::acquire_single(
                &self.prod.limit,
                &self.cons.limit,
                ev.len() as u32,
                self.prod.capacity,
            ),
            _ => Self::acquire_multi(&self.prod.limit, &self.prod, ev.len() as u32),
        };
        if r.actual == 0 {
            return 0;
        }
        // Step 2: write slots.
        self.write_slots(ev, &r);
        // Step 3: release slots to the consumer.
        Self::release_slots(&self.cons.limit, r.index, r.actual, false, self.pmode.into());
        r.actual as usize
    }

    /// Dequeue elements from the head into `ev`; returns the count and the
    /// ring index of the first element.
    pub fn dequeue(&self, ev: &mut [T]) -> (usize, u32) {
        if self.cmode == Consumer::LockFree {
            // Speculatively read, then commit by advancing the head; the
            // reads are non-destructive so a lost race just retries.
            let tail = cur_of(self.cons.limit.load(Ordering::Acquire));
            let mut head = cur_of(self.prod.limit.load(Ordering::Relaxed));
            loop {
                let actual = (ev.len() as i32).min(tail.wrapping_sub(head) as i32);
                if actual <= 0 {
                    return (0, 0);
                }
                let r = Taken {
                    index: head,
                    actual: actual as u32,
                };
                self.read_slots(ev, &r);
                match self.prod.limit.compare_exchange(
                    pack(head, 0),
                    pack(head.wrapping_add(actual as u32), 0),
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return (actual as usize, head),
                    Err(cur) => head = cur_of(cur),
                }
            }
        }
        // Step 1: acquire slots.
        let r = match self.cmode {
            Consumer::Single => {
                Self::acquire_single(&self.cons.limit, &self.prod.limit, ev.len() as u32, 0)
            }
            _ => Self::acquire_multi(&self.cons.limit, &self.cons, ev.len() as u32),
        };
        if r.actual == 0 {
            return (0, 0);
        }
        // Step 2: read slots.
        self.read_slots(ev, &r);
        // Step 3: release slots to the producer (only loads to order).
        Self::release_slots(&self.prod.limit, r.index, r.actual, true, self.cmode.into());
        (r.actual as usize, r.index)
    }
}

impl<T: Copy> Drop for RingBuf<T> {
    fn drop(&mut self) {
        if cur_of(self.prod.limit.load(Ordering::Relaxed))
            != cur_of(self.cons.limit.load(Ordering::Relaxed))
        {
            errhnd::report("ringbuf", "ring buffer not empty", self as *const _ as usize);
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sp_sc_roundtrip() {
        let rb = RingBuf::new(4, Producer::Single, Consumer::Single).unwrap();
        assert_eq!(rb.enqueue(&[1u64, 2, 3, 4, 5]), 4);
        let mut out = [0u64; 8];
        let (n, idx) = rb.dequeue(&mut out);
        assert_eq!((n, idx), (4, 0));
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        let (n, _) = rb.dequeue(&mut out);
        assert_eq!(n, 0);
    }

    fn mpmc(pmode: Producer, cmode: Consumer) {
        let rb = RingBuf::new(32, pmode, cmode).unwrap();
        let total = AtomicU64::new(0);
        let consumed = AtomicU64::new(0);
        std::thread::scope(|s| {
            for t in 0..2u64 {
                let rb = &rb;
                s.spawn(move || {
                    for i in 0..500u64 {
                        let v = t * 1000 + i + 1;
                        while rb.enqueue(&[v]) == 0 {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    let mut out = [0u64; 4];
                    while consumed.load(Ordering::Relaxed) < 1000 {
                        let (n, _) = rb.dequeue(&mut out);
                        if n == 0 {
                            std::thread::yield_now();
                            continue;
                        }
                        let sum: u64 = out[..n].iter().sum();
                        total.fetch_add(sum, Ordering::Relaxed);
                        consumed.fetch_add(n as u64, Ordering::Relaxed);
                    }
                });
            }
        });
        let expect: u64 = (1..=500).sum::<u64>() + (1001..=1500).sum::<u64>();
        assert_eq!(total.load(Ordering::Relaxed), expect);
    }

    #[test]
    fn mp_mc_blocking() {
        mpmc(Producer::MultiBlocking, Consumer::MultiBlocking);
    }

    #[test]
    fn mp_mc_nonblocking() {
        mpmc(Producer::MultiNonBlocking, Consumer::MultiNonBlocking);
    }

    #[test]
    fn mp_lockfree_dequeue() {
        mpmc(Producer::MultiBlocking, Consumer::LockFree);
    }
}
