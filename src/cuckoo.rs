/*!
Cuckoo hash table with an overflow cellar.

Every key has two candidate buckets: `h1 = hash mod N` and
`h2 = crc32c(hash) mod N` (bumped by one if it collides with `h1`). A
bucket is one cache line holding `BKT_SIZE` element pointers, a parallel
array of 16-bit signatures for fast negative probes, and a change counter
whose low bit flags overflow into the cellar.

When both buckets are full, an element is relocated to its alternate bucket
with a three-step lock-free move: (1) the element is written into the
reserved destination slot tagged `SRC|src_idx`, (2) the source slot is
tagged `DST|dst_idx`, the primary bucket's change counter is bumped and the
source cleared, (3) the destination tags are stripped. Any thread observing
a tagged slot can complete the remaining steps.

Element pointers carry the move tags in their low five bits, so elements
must be 32-byte aligned (e.g. `#[repr(align(32))]`).
*/

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use portable_atomic::AtomicU128;

use crate::errhnd;
use crate::hazptr::Hazard;
use crate::smr::{self, Smr};
use crate::utils::{crc32c_u64, ring_add, ring_mod};

/// Slots per bucket (one cache line).
pub const BKT_SIZE: usize = 6;

// Slot is the destination of a move in progress.
const TAG_DST: usize = 1;
// Slot is the source of a move in progress.
const TAG_SRC: usize = 2;
// Index into the peer bucket of a move in progress.
const IDX_SHIFT: u32 = 2;
const BITS_IDX: usize = 7 << IDX_SHIFT;
const BITS_ALL: usize = TAG_DST | TAG_SRC | BITS_IDX;

#[inline]
fn has_dst(ptr: usize) -> bool {
    ptr & TAG_DST != 0
}

#[inline]
fn has_src(ptr: usize) -> bool {
    ptr & TAG_SRC != 0
}

#[inline]
fn has_any(ptr: usize) -> bool {
    ptr & BITS_ALL != 0
}

#[inline]
fn clr_all(ptr: usize) -> usize {
    ptr & !BITS_ALL
}

#[inline]
fn get_idx(ptr: usize) -> usize {
    (ptr & BITS_IDX) >> IDX_SHIFT
}

#[inline]
fn set_idx(ptr: usize, idx: usize) -> usize {
    ptr | (idx << IDX_SHIFT)
}

// Change counter: low bit flags cellar overflow.
const CELLAR_BIT: u32 = 1;
const CHGCNT_INC: u32 = 2;

/// Embedded link: the element's hash, written by insert.
pub struct CuckooLink {
    hash: AtomicU64,
}

impl CuckooLink {
    pub const fn new() -> Self {
        Self {
            hash: AtomicU64::new(0),
        }
    }
}

impl Default for CuckooLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract between the table and its elements.
///
/// # Safety
///
/// `link` must return the same embedded link for the element's lifetime;
/// the element must be 32-byte aligned and stay valid while linked.
pub unsafe trait CuckooEntry: Sized {
    type Key: ?Sized;
    fn link(&self) -> &CuckooLink;
    fn key_matches(&self, key: &Self::Key) -> bool;
}

#[repr(align(64))]
struct Bucket {
    chgcnt: AtomicU32,
    sigs: [AtomicU16; BKT_SIZE],
    elems: [AtomicUsize; BKT_SIZE],
}

/// Cuckoo hash table of `NonNull<E>` elements.
pub struct CuckooHt<E: CuckooEntry> {
    nbkts: usize,
    ncells: usize,
    use_hp: bool,
    buckets: Box<[Bucket]>,
    /// `(elem, hash)` pairs, written atomically.
    cellar: Box<[AtomicU128]>,
    _marker: PhantomData<*mut E>,
}

unsafe impl<E: CuckooEntry> Send for CuckooHt<E> {}
unsafe impl<E: CuckooEntry> Sync for CuckooHt<E> {}

#[inline]
fn cell_elem(word: u128) -> usize {
    word as u64 as usize
}

#[inline]
fn cell_hash(word: u128) -> u64 {
    (word >> 64) as u64
}

#[inline]
fn cell_pack(elem: usize, hash: u64) -> u128 {
    ((hash as u128) << 64) | elem as u64 as u128
}

impl<E: CuckooEntry> CuckooHt<E> {
    /// Allocate a table with room for `nelems` elements plus `ncells`
    /// cellar cells.
    pub fn new(nelems: usize, ncells: usize, smr: Smr) -> Option<Self> {
        if nelems == 0 {
            errhnd::report("cuckooht", "invalid number of elements", nelems);
            return None;
        }
        let nbkts = nelems.div_ceil(BKT_SIZE).max(2);
        let buckets = (0..nbkts)
            .map(|_| Bucket {
                chgcnt: AtomicU32::new(0),
                sigs: [(); BKT_SIZE].map(|_| AtomicU16::new(0)),
                elems: [(); BKT_SIZE].map(|_| AtomicUsize::new(0)),
            })
            .collect();
        Some(Self {
            nbkts,
            ncells,
            use_hp: smr.use_hp(),
            buckets,
            cellar: (0..ncells).map(|_| AtomicU128::new(0)).collect(),
            _marker: PhantomData,
        })
    }

    #[inline]
    fn bix0(&self, hash: u64) -> usize {
        ring_mod(hash, self.nbkts)
    }

    #[inline]
    fn bix1(&self, hash: u64) -> usize {
        let bix0 = self.bix0(hash);
        let bix1 = ring_mod(crc32c_u64(0, hash) as u64, self.nbkts);
        if bix1 == bix0 {
            ring_add(bix1, 1, self.nbkts)
        } else {
            bix1
        }
    }

    /// The other candidate bucket for an element currently in `bix`.
    fn sibling_bix(&self, hash: u64, bix: usize) -> usize {
        let bix0 = self.bix0(hash);
        if bix0 != bix {
            bix0
        } else {
            self.bix1(hash)
        }
    }

    fn load_slot(&self, bix: usize, i: usize, hp: &mut Hazard) -> usize {
        if self.use_hp {
            crate::hazptr::acquire_with(hp, !BITS_ALL, |mo| {
                self.buckets[bix].elems[i].load(mo)
            })
        } else {
            self.buckets[bix].elems[i].load(Ordering::Acquire)
        }
    }

    /// Look up by key and hash; probes both buckets and, when flagged, the
    /// cellar. In HP mode the hazard stays set on the returned element.
    pub fn lookup(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        let bix0 = self.bix0(hash);
        let bix1 = self.bix1(hash);
        let sig = hash as u16;
        let chgcnt = loop {
            let chgcnt = self.buckets[bix0].chgcnt.load(Ordering::Acquire);
            for &bix in &[bix0, bix1] {
                for i in 0..BKT_SIZE {
                    if self.buckets[bix].sigs[i].load(Ordering::Relaxed) != sig {
                        continue;
                    }
                    let elem = clr_all(self.load_slot(bix, i, hp));
                    if elem != 0 {
                        let e = unsafe { &*(elem as *const E) };
                        if e.link().hash.load(Ordering::Relaxed) == hash && e.key_matches(key) {
                            return Some(unsafe { NonNull::new_unchecked(elem as *mut E) });
                        }
                    }
                    // Else false positive signature match.
                }
            }
            // Re-read the change counter: an element may have moved
            // between the buckets while we scanned.
            fence(Ordering::Acquire);
            if self.buckets[bix0].chgcnt.load(Ordering::Relaxed) == chgcnt {
                break chgcnt;
            }
        };
        if chgcnt & CELLAR_BIT != 0 {
            return self.search_cellar(key, hash, hp);
        }
        smr::ptr_release(self.use_hp, hp);
        None
    }

    fn search_cellar(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        if self.ncells == 0 {
            return None;
        }
        let start = ring_mod(hash, self.ncells);
        let mut idx = start;
        loop {
            let word = self.cellar[idx].load(Ordering::Relaxed);
            if cell_hash(word) == hash {
                let elem = if self.use_hp {
                    crate::hazptr::acquire_with(hp, !BITS_ALL, |mo| {
                        cell_elem(self.cellar[idx].load(mo))
                    })
                } else {
                    cell_elem(self.cellar[idx].load(Ordering::Acquire))
                };
                if elem != 0 && unsafe { &*(elem as *const E) }.key_matches(key) {
                    return Some(unsafe { NonNull::new_unchecked(elem as *mut E) });
                }
            }
            idx = ring_add(idx, 1, self.ncells);
            if idx == start {
                smr::ptr_release(self.use_hp, hp);
                return None;
            }
        }
    }

    /// Swing a signature field, giving up if the element is replaced.
    fn write_sig(&self, bix: usize, idx: usize, mut oldsig: u16, elem: usize, newsig: u16) {
        let bkt = &self.buckets[bix];
        loop {
            if bkt.sigs[idx]
                .compare_exchange(oldsig, newsig, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // Another thread wrote sig (and possibly elem) after our elem
            // write; only retry while our element is still in place.
            fence(Ordering::SeqCst);
            oldsig = bkt.sigs[idx].load(Ordering::Relaxed);
            if bkt.elems[idx].load(Ordering::Relaxed) != elem {
                return;
            }
        }
    }

    /// Try to claim an empty slot from `mask` for a new element.
    fn bucket_insert(&self, bix: usize, mut mask: u32, elem: usize, hash: u64) -> bool {
        let bkt = &self.buckets[bix];
        while mask != 0 {
            let i = mask.trailing_zeros() as usize;
            let oldsig = bkt.sigs[i].load(Ordering::Relaxed);
            if bkt.elems[i]
                .compare_exchange(0, elem, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.write_sig(bix, i, oldsig, elem, hash as u16);
                return true;
            }
            mask &= !(1 << i);
        }
        false
    }

    /// Insert an element under `hash`. Returns false when the table and
    /// cellar are full.
    ///
    /// # Safety
    ///
    /// `elem` must be 32-byte aligned, not currently linked, and stay
    /// valid while linked.
    pub unsafe fn insert(&self, elem: NonNull<E>, hash: u64) -> bool {
        let elem_usize = elem.as_ptr() as usize;
        if has_any(elem_usize) {
            errhnd::report("cuckooht", "element has low bits set", elem_usize);
            return false;
        }
        unsafe { elem.as_ref() }.link().hash.store(hash, Ordering::Relaxed);
        smr::enter(self.use_hp);
        let bix0 = self.bix0(hash);
        let bix1 = self.bix1(hash);
        let success = loop {
            // Compute the emptiness of both buckets; inserting into the
            // least full one raises the achievable load factor.
            let mut empty0 = 0u32;
            let mut empty1 = 0u32;
            for i in 0..BKT_SIZE {
                if self.buckets[bix0].elems[i].load(Ordering::Relaxed) == 0 {
                    empty0 |= 1 << i;
                }
                if self.buckets[bix1].elems[i].load(Ordering::Relaxed) == 0 {
                    empty1 |= 1 << i;
                }
            }
            let (first, fmask, second, smask) = if empty0.count_ones() > empty1.count_ones() {
                (bix0, empty0, bix1, empty1)
            } else {
                (bix1, empty1, bix0, empty0)
            };
            if self.bucket_insert(first, fmask, elem_usize, hash) {
                break true;
            }
            if self.bucket_insert(second, smask, elem_usize, hash) {
                break true;
            }
            if self.make_room(bix0) || self.make_room(bix1) {
                continue;
            }
            // Both buckets stuck; fall back to the cellar.
            break self.insert_cell(elem_usize, hash, bix0);
        };
        smr::leave(self.use_hp);
        success
    }

    /// Reserve an empty slot in the destination bucket.
    fn find_empty(&self, dst_bix: usize) -> Option<usize> {
        let bkt = &self.buckets[dst_bix];
        for i in 0..BKT_SIZE {
            if bkt.elems[i].load(Ordering::Relaxed) == 0
                && bkt.elems[i]
                    .compare_exchange(0, TAG_DST, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(i);
            }
        }
        None
    }

    /// Step 1 of a move: publish the element into the reserved destination
    /// slot, tagged with the source index.
    fn move_elem(&self, elem: usize, src_bix: usize, src_idx: usize, dst_bix: usize, dst_idx: usize) {
        debug_assert!(!has_any(elem));
        let dst_bkt = &self.buckets[dst_bix];
        let oldsig = dst_bkt.sigs[dst_idx].load(Ordering::Relaxed);
        let hash = unsafe { &*(elem as *const E) }.link().hash.load(Ordering::Relaxed);
        if dst_bkt.elems[dst_idx]
            .compare_exchange(
                TAG_DST,
                set_idx(elem | TAG_SRC, src_idx),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.write_sig(dst_bix, dst_idx, oldsig, elem, hash as u16);
        }
        // Else the destination slot was already updated.
        self.clear_src(elem, src_bix, src_idx, dst_bix, dst_idx);
    }

    /// Step 2: bump the primary bucket's change counter, then clear the
    /// source slot.
    fn clear_src(&self, elem: usize, src_bix: usize, src_idx: usize, dst_bix: usize, dst_idx: usize) {
        debug_assert!(!has_any(elem));
        let src_bkt = &self.buckets[src_bix];
        let old = set_idx(elem | TAG_DST, dst_idx);
        if src_bkt.elems[src_idx].load(Ordering::Relaxed) == old {
            // The change counter of the primary bucket always takes the
            // hit, so lookups only need to watch one counter.
            let hash = unsafe { &*(elem as *const E) }.link().hash.load(Ordering::Relaxed);
            let bix = self.bix0(hash);
            self.buckets[bix].chgcnt.fetch_add(CHGCNT_INC, Ordering::Relaxed);
            let _ = src_bkt.elems[src_idx].compare_exchange(
                old,
                0,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
        self.clean_dst(elem, dst_bix, dst_idx, src_idx);
    }

    /// Step 3: strip the move tags from the destination slot.
    fn clean_dst(&self, elem: usize, dst_bix: usize, dst_idx: usize, src_idx: usize) {
        debug_assert!(!has_any(elem));
        let old = set_idx(elem | TAG_SRC, src_idx);
        let _ = self.buckets[dst_bix].elems[dst_idx].compare_exchange(
            old,
            elem,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Complete a move observed through a tagged slot.
    fn help_move(&self, tagged: usize, bix0: usize, idx0: usize) {
        debug_assert!(has_any(tagged));
        let elem = clr_all(tagged);
        let hash = unsafe { &*(elem as *const E) }.link().hash.load(Ordering::Relaxed);
        let bix1 = self.sibling_bix(hash, bix0);
        let idx1 = get_idx(tagged);
        debug_assert!(idx1 < BKT_SIZE);
        if has_dst(tagged) {
            // This slot is the source.
            self.move_elem(elem, bix0, idx0, bix1, idx1);
        } else if has_src(tagged) {
            // This slot is the destination.
            self.move_elem(elem, bix1, idx1, bix0, idx0);
        }
    }

    /// Free a slot in `src_bix` by moving one of its elements to the
    /// element's other bucket.
    fn make_room(&self, src_bix: usize) -> bool {
        let mut hp = Hazard::null();
        let bkt = &self.buckets[src_bix];
        for src_idx in 0..BKT_SIZE {
            let raw = self.load_slot(src_bix, src_idx, &mut hp);
            if raw == 0 {
                // Slot unexpectedly became empty.
                smr::ptr_release(self.use_hp, &mut hp);
                return true;
            }
            if has_any(raw) {
                if clr_all(raw) != 0 {
                    self.help_move(raw, src_bix, src_idx);
                }
                // Else the slot is a bare reservation.
                continue;
            }
            // A clean element: reserve an empty slot in its sibling.
            let hash = unsafe { &*(clr_all(raw) as *const E) }
                .link()
                .hash
                .load(Ordering::Relaxed);
            let dst_bix = self.sibling_bix(hash, src_bix);
            let Some(dst_idx) = self.find_empty(dst_bix) else {
                continue;
            };
            // Tag the source element with the destination index.
            if bkt.elems[src_idx]
                .compare_exchange(
                    raw,
                    set_idx(raw | TAG_DST, dst_idx),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // Move started; complete it ourselves.
                self.move_elem(raw, src_bix, src_idx, dst_bix, dst_idx);
                smr::ptr_release(self.use_hp, &mut hp);
                return true;
            }
            // Slot changed: undo the reservation.
            if self.buckets[dst_bix].elems[dst_idx]
                .compare_exchange(TAG_DST, 0, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                errhnd::report("cuckooht", "failed to clear reservation", dst_idx);
            }
        }
        smr::ptr_release(self.use_hp, &mut hp);
        false
    }

    fn insert_cell(&self, elem: usize, hash: u64, bix0: usize) -> bool {
        if self.ncells == 0 {
            return false;
        }
        let start = ring_mod(hash, self.ncells);
        let mut idx = start;
        loop {
            let word = self.cellar[idx].load(Ordering::Relaxed);
            if cell_elem(word) == 0
                && self.cellar[idx]
                    .compare_exchange(
                        word,
                        cell_pack(elem, hash),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                // Flag the primary bucket.
                let bkt = &self.buckets[bix0];
                let mut old = bkt.chgcnt.load(Ordering::Relaxed);
                loop {
                    let new = (old.wrapping_add(CHGCNT_INC)) | CELLAR_BIT;
                    match bkt.chgcnt.compare_exchange(
                        old,
                        new,
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return true,
                        Err(cur) => old = cur,
                    }
                }
            }
            idx = ring_add(idx, 1, self.ncells);
            if idx == start {
                return false;
            }
        }
    }

    /// Remove a specific element. Returns false when not present.
    pub fn remove(&self, elem: NonNull<E>, hash: u64) -> bool {
        let elem_usize = elem.as_ptr() as usize;
        if has_any(elem_usize) {
            errhnd::report("cuckooht", "element has low bits set", elem_usize);
            return false;
        }
        smr::enter(self.use_hp);
        let bix0 = self.bix0(hash);
        let bix1 = self.bix1(hash);
        let mut success = false;
        let chgcnt = loop {
            let chgcnt = self.buckets[bix0].chgcnt.load(Ordering::Acquire);
            for &bix in &[bix0, bix1] {
                let mut mask = 0u32;
                for i in 0..BKT_SIZE {
                    if clr_all(self.buckets[bix].elems[i].load(Ordering::Relaxed)) == elem_usize
                    {
                        mask |= 1 << i;
                    }
                }
                if mask != 0 && self.bucket_remove(bix, elem_usize, hash, mask) {
                    success = true;
                    break;
                }
            }
            if success {
                break 0;
            }
            fence(Ordering::Acquire);
            if self.buckets[bix0].chgcnt.load(Ordering::Relaxed) == chgcnt {
                break chgcnt;
            }
        };
        if !success && chgcnt & CELLAR_BIT != 0 {
            success = self.remove_cell_by_ptr(elem_usize, hash);
        }
        smr::leave(self.use_hp);
        success
    }

    fn bucket_remove(&self, bix: usize, elem: usize, hash: u64, mut mask: u32) -> bool {
        let bkt = &self.buckets[bix];
        let mut hp = Hazard::null();
        while mask != 0 {
            let i = mask.trailing_zeros() as usize;
            loop {
                let old = self.load_slot(bix, i, &mut hp);
                if !has_any(old) {
                    break;
                }
                // A move is in progress through this slot; help finish it.
                if clr_all(old) != 0 {
                    self.help_move(old, bix, i);
                } else {
                    break;
                }
            }
            smr::ptr_release(self.use_hp, &mut hp);
            let oldsig = bkt.sigs[i].load(Ordering::Relaxed);
            if bkt.elems[i]
                .compare_exchange(elem, 0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                // Invalidate the signature.
                self.write_sig(bix, i, oldsig, 0, hash as u16);
                return true;
            }
            mask &= !(1 << i);
        }
        false
    }

    fn remove_cell_by_ptr(&self, elem: usize, hash: u64) -> bool {
        if self.ncells == 0 {
            return false;
        }
        let start = ring_mod(hash, self.ncells);
        let mut idx = start;
        loop {
            let word = self.cellar[idx].load(Ordering::Relaxed);
            if cell_elem(word) == elem
                && self.cellar[idx]
                    .compare_exchange(
                        cell_pack(elem, hash),
                        cell_pack(0, !hash),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                self.update_cellar(self.bix0(hash));
                return true;
            }
            idx = ring_add(idx, 1, self.ncells);
            if idx == start {
                return false;
            }
        }
    }

    /// Recompute a bucket's cellar bit after a cellar removal.
    fn update_cellar(&self, bix: usize) {
        let bkt = &self.buckets[bix];
        loop {
            let old = bkt.chgcnt.load(Ordering::Acquire);
            let mut new = old & !CELLAR_BIT;
            for cell in self.cellar.iter() {
                let word = cell.load(Ordering::Relaxed);
                if cell_elem(word) != 0 && ring_mod(cell_hash(word), self.nbkts) == bix {
                    new |= CELLAR_BIT;
                    break;
                }
            }
            if new == old {
                return;
            }
            new = new.wrapping_add(CHGCNT_INC);
            if bkt
                .chgcnt
                .compare_exchange(old, new, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Visit every element. Cellar indices have the top bit set.
    pub fn traverse(&self, mut cb: impl FnMut(NonNull<E>, usize)) {
        let mut hp = Hazard::null();
        for bix in 0..self.nbkts {
            for i in 0..BKT_SIZE {
                let elem = clr_all(self.load_slot(bix, i, &mut hp));
                if elem != 0 {
                    smr::enter(self.use_hp);
                    cb(
                        unsafe { NonNull::new_unchecked(elem as *mut E) },
                        bix * BKT_SIZE + i,
                    );
                    smr::leave(self.use_hp);
                }
            }
        }
        for idx in 0..self.ncells {
            let elem = if self.use_hp {
                crate::hazptr::acquire_with(&mut hp, !BITS_ALL, |mo| {
                    cell_elem(self.cellar[idx].load(mo))
                })
            } else {
                cell_elem(self.cellar[idx].load(Ordering::Acquire))
            };
            if elem != 0 {
                smr::enter(self.use_hp);
                cb(
                    unsafe { NonNull::new_unchecked(clr_all(elem) as *mut E) },
                    idx | (1 << (usize::BITS - 1)),
                );
                smr::leave(self.use_hp);
            }
        }
        smr::ptr_release(self.use_hp, &mut hp);
    }
}

impl<E: CuckooEntry> Drop for CuckooHt<E> {
    fn drop(&mut self) {
        for bkt in self.buckets.iter() {
            for e in &bkt.elems {
                if e.load(Ordering::Relaxed) != 0 {
                    errhnd::report("cuckooht", "hash table not empty", 0);
                    return;
                }
            }
        }
        for cell in self.cellar.iter() {
            if cell_elem(cell.load(Ordering::Relaxed)) != 0 {
                errhnd::report("cuckooht", "hash table not empty", 0);
                return;
            }
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazptr::{self, HpDomain};
    use std::collections::BTreeSet;

    #[repr(align(32))]
    struct Item {
        link: CuckooLink,
        key: u64,
    }

    unsafe impl CuckooEntry for Item {
        type Key = u64;
        fn link(&self) -> &CuckooLink {
            &self.link
        }
        fn key_matches(&self, key: &u64) -> bool {
            self.key == *key
        }
    }

    fn item(key: u64) -> NonNull<Item> {
        NonNull::from(Box::leak(Box::new(Item {
            link: CuckooLink::new(),
            key,
        })))
    }

    #[test]
    fn colliding_keys_roundtrip() {
        let dom = HpDomain::new(64, 8).unwrap();
        hazptr::register(&dom);
        let ht: CuckooHt<Item> = CuckooHt::new(16, 4, Smr::HazardPointers).unwrap();

        // All four keys hash to 0, forcing the alternate bucket (and
        // possibly the cellar).
        let keys = [242u64, 243, 244, 245];
        let items: Vec<_> = keys.iter().map(|&k| item(k)).collect();
        for it in &items {
            assert!(unsafe { ht.insert(*it, 0) });
        }

        let mut hp = Hazard::null();
        for (&k, it) in keys.iter().zip(&items) {
            let found = ht.lookup(&k, 0, &mut hp).unwrap();
            assert_eq!(found, *it);
            hazptr::release(&mut hp);
        }

        let mut seen = BTreeSet::new();
        ht.traverse(|e, _| {
            seen.insert(unsafe { e.as_ref() }.key);
        });
        assert_eq!(seen, BTreeSet::from(keys));

        for it in &items {
            assert!(ht.remove(*it, 0));
        }
        for &k in &keys {
            assert!(ht.lookup(&k, 0, &mut hp).is_none());
        }
        for it in items {
            drop(unsafe { Box::from_raw(it.as_ptr()) });
        }
        // The table is empty; dropping it must not report.
        drop(ht);
        hazptr::unregister();
    }

    #[test]
    fn fills_both_buckets_and_cellar() {
        let dom = HpDomain::new(64, 8).unwrap();
        hazptr::register(&dom);
        // Two buckets (12 slots) + 4 cells; 16 colliding keys fill it all.
        let ht: CuckooHt<Item> = CuckooHt::new(12, 4, Smr::HazardPointers).unwrap();
        let items: Vec<_> = (0..16).map(item).collect();
        for it in &items {
            assert!(unsafe { ht.insert(*it, 0) });
        }
        // Next one cannot fit anywhere.
        let extra = item(99);
        assert!(!unsafe { ht.insert(extra, 0) });

        let mut hp = Hazard::null();
        for (k, it) in items.iter().enumerate() {
            let found = ht.lookup(&(k as u64), 0, &mut hp).unwrap();
            assert_eq!(found, *it);
            hazptr::release(&mut hp);
        }
        for it in &items {
            assert!(ht.remove(*it, 0));
        }
        for it in items {
            drop(unsafe { Box::from_raw(it.as_ptr()) });
        }
        drop(unsafe { Box::from_raw(extra.as_ptr()) });
        hazptr::unregister();
    }
}
