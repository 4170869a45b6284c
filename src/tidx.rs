//! Process-wide thread index allocator: a bitmap handing out indices in
//! `0..MAX_THREADS`. Reclamation domains use the index to address their
//! per-thread arrays.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::MAX_THREADS;

const NWORDS: usize = MAX_THREADS.div_ceil(64);

static WORDS: [AtomicU64; NWORDS] = [const { AtomicU64::new(0) }; NWORDS];

/// Allocate the lowest free index, or `None` when all are taken.
pub(crate) fn alloc() -> Option<u32> {
    for (w, word) in WORDS.iter().enumerate() {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            let free = !cur;
            if free == 0 {
                break;
            }
            let bit = free.trailing_zeros();
            match word.compare_exchange_weak(
                cur,
                cur | 1 << bit,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((w * 64) as u32 + bit),
                Err(actual) => cur = actual,
            }
        }
    }
    None
}

/// Return an index to the pool.
pub(crate) fn free(idx: u32) {
    let idx = idx as usize;
    debug_assert!(idx < MAX_THREADS);
    let prev = WORDS[idx / 64].fetch_and(!(1 << (idx % 64)), Ordering::Release);
    debug_assert!(prev & (1 << (idx % 64)) != 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle() {
        let a = alloc().unwrap();
        let b = alloc().unwrap();
        assert_ne!(a, b);
        free(a);
        free(b);
    }
}
