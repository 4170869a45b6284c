/*!
Reader/writer synchronization with a sequence counter (seqlock).

Readers never block: they snapshot the counter, read the protected data and
validate that the counter is unchanged and even. Writers make the counter
odd for the duration of the write. [`RwSync::read`]/[`RwSync::write`] wrap
the protocol around a word-wise atomic copy of a caller-supplied region.
*/

use std::mem::size_of;

use crate::sync::atomic::{fence, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use crate::utils::doze;

const WRITER: u32 = 1;

/// Sequence lock. Even counter = no write in progress.
pub struct RwSync {
    seq: AtomicU32,
}

impl RwSync {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    #[inline]
    fn wait_for_no_writer(&self, order: Ordering) -> u32 {
        let mut l = self.seq.load(order);
        while l & WRITER != 0 {
            doze();
            l = self.seq.load(order);
        }
        l
    }

    /// Begin a read-side critical section; returns the token to validate
    /// with.
    pub fn acquire_rd(&self) -> u32 {
        // Wait for any present writer to go away.
        // A0: read sync, synchronize with A1
        self.wait_for_no_writer(Ordering::Acquire)
    }

    /// End a read-side critical section. Returns `true` when the reads
    /// were consistent; on `false` the caller must retry.
    pub fn release_rd(&self, prv: u32) -> bool {
        // B0: reads (by caller) + fence-acquire, synchronize with B1
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) == prv
    }

    pub fn acquire_wr(&self) {
        loop {
            // Set the writer flag (it may already be set).
            // A2: read (and write) sync, synchronize with A1
            let l = self.seq.fetch_or(WRITER, Ordering::Acquire);
            if l & WRITER == 0 {
                break;
            }
            self.wait_for_no_writer(Ordering::Relaxed);
        }
        // B1: fence-release + stores (by caller), synchronize with B0
        fence(Ordering::Release);
    }

    pub fn release_wr(&self) {
        let cur = self.seq.load(Ordering::Relaxed);
        if cur & WRITER == 0 {
            crate::errhnd::report("rwsync", "invalid write release", self as *const _ as usize);
            return;
        }
        // Increment, clearing the writer flag.
        // A1: write sync, synchronize with A0/A2
        self.seq.store(cur.wrapping_add(1), Ordering::Release);
    }

    /// Read `data.len()` bytes into `dst` under the validation protocol.
    ///
    /// # Safety
    ///
    /// The regions must not overlap, `data` must be word-aligned, and it
    /// must only ever be written under this lock's write side.
    pub unsafe fn read_bytes(&self, dst: &mut [u8], data: *const u8) {
        loop {
            let prv = self.acquire_rd();
            unsafe { atomic_memcpy_from(dst, data) };
            if self.release_rd(prv) {
                return;
            }
        }
    }

    /// Publish `src.len()` bytes into `data` under the write side.
    ///
    /// # Safety
    ///
    /// Same region contract as [`RwSync::read_bytes`].
    pub unsafe fn write_bytes(&self, src: &[u8], data: *mut u8) {
        self.acquire_wr();
        unsafe { atomic_memcpy_to(data, src) };
        self.release_wr();
    }
}

#[cfg(not(loom))]
impl Default for RwSync {
    fn default() -> Self {
        Self::new()
    }
}

// Word-wise copies so racing readers tear at most at word granularity,
// which the sequence validation then rejects.

unsafe fn atomic_memcpy_from(dst: &mut [u8], mut src: *const u8) {
    let mut remaining = dst.len();
    let mut out = dst.as_mut_ptr();
    unsafe {
        while remaining >= size_of::<usize>() {
            let v = (*(src as *const AtomicUsize)).load(Ordering::Relaxed);
            (out as *mut usize).write_unaligned(v);
            src = src.add(size_of::<usize>());
            out = out.add(size_of::<usize>());
            remaining -= size_of::<usize>();
        }
        while remaining > 0 {
            let v = (*(src as *const AtomicU8)).load(Ordering::Relaxed);
            *out = v;
            src = src.add(1);
            out = out.add(1);
            remaining -= 1;
        }
    }
}

unsafe fn atomic_memcpy_to(mut dst: *mut u8, src: &[u8]) {
    let mut remaining = src.len();
    let mut inp = src.as_ptr();
    unsafe {
        while remaining >= size_of::<usize>() {
            let v = (inp as *const usize).read_unaligned();
            (*(dst as *const AtomicUsize)).store(v, Ordering::Relaxed);
            inp = inp.add(size_of::<usize>());
            dst = dst.add(size_of::<usize>());
            remaining -= size_of::<usize>();
        }
        while remaining > 0 {
            (*(dst as *const AtomicU8)).store(*inp, Ordering::Relaxed);
            inp = inp.add(1);
            dst = dst.add(1);
            remaining -= 1;
        }
    }
}

// -------------------------------------

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn read_validates() {
        let sync = RwSync::new();
        let t = sync.acquire_rd();
        assert!(sync.release_rd(t));
        sync.acquire_wr();
        sync.release_wr();
        // Counter moved on: a stale token no longer validates.
        assert!(!sync.release_rd(t));
    }

    #[test]
    fn no_torn_pairs() {
        #[repr(align(8))]
        struct Pair(std::cell::UnsafeCell<[u8; 16]>);
        unsafe impl Sync for Pair {}
        let sync = RwSync::new();
        let data = Pair(std::cell::UnsafeCell::new([0u8; 16]));
        let data_ptr = data.0.get() as usize;

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 1..=1000u64 {
                    let mut src = [0u8; 16];
                    src[..8].copy_from_slice(&i.to_ne_bytes());
                    src[8..].copy_from_slice(&i.to_ne_bytes());
                    unsafe { sync.write_bytes(&src, data_ptr as *mut u8) };
                }
            });
            s.spawn(|| {
                for _ in 0..1000 {
                    let mut dst = [0u8; 16];
                    unsafe { sync.read_bytes(&mut dst, data_ptr as *const u8) };
                    let a = u64::from_ne_bytes(dst[..8].try_into().unwrap());
                    let b = u64::from_ne_bytes(dst[8..].try_into().unwrap());
                    assert_eq!(a, b);
                }
            });
        });
    }
}
