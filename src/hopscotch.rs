/*!
Hopscotch hash table with an overflow cellar.

Every bucket holds one element and a single metadata word (`bmc`): a 24-bit
neighbourhood bitmap describing which of the following buckets hold elements
whose home bucket is this one, an 8-bit signature of the element stored in
*this* bucket, a 31-bit change counter and one bit flagging overflow into
the cellar. The `(bmc, elem)` pair of a bucket is written with a single
128-bit CAS; bitmap changes bump the counter so readers can detect
concurrent moves and retry.

Inserting hops a distant empty bucket closer by relocating elements, one
single-bucket CAS at a time. When no empty bucket can be moved into the
neighbourhood the element overflows into the cellar, a small linear-probed
`(hash, elem)` table, and the home bucket's cellar bit is set.
*/

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, Ordering};

use portable_atomic::AtomicU128;

use crate::errhnd;
use crate::hazptr::Hazard;
use crate::smr::{self, Smr};
use crate::utils::{ring_add, ring_mod, ring_sub};

/// Neighbourhood size: reach of the per-bucket bitmap.
pub const BITMAP_BITS: usize = 24;

const BITMAP_MASK: u64 = (1 << BITMAP_BITS) - 1;
const SIG_SHIFT: u32 = 24;
const SIG_MASK: u64 = 0xff;
const COUNT_SHIFT: u32 = 32;
const COUNT_MASK: u64 = 0x7fff_ffff;
const CELLAR_SHIFT: u32 = 63;

#[inline]
fn bmc_of(word: u128) -> u64 {
    word as u64
}

#[inline]
fn elem_of(word: u128) -> usize {
    (word >> 64) as u64 as usize
}

#[inline]
fn pack(bmc: u64, elem: usize) -> u128 {
    ((elem as u64 as u128) << 64) | bmc as u128
}

#[inline]
fn bitmap(bmc: u64) -> u64 {
    bmc & BITMAP_MASK
}

#[inline]
fn sig(bmc: u64) -> u64 {
    (bmc >> SIG_SHIFT) & SIG_MASK
}

#[inline]
fn count(bmc: u64) -> u64 {
    (bmc >> COUNT_SHIFT) & COUNT_MASK
}

#[inline]
fn cellar_bit(bmc: u64) -> bool {
    bmc >> CELLAR_SHIFT != 0
}

#[inline]
fn pack_bmc(bitmap: u64, sig: u64, count: u64, cellar: bool) -> u64 {
    (bitmap & BITMAP_MASK)
        | ((sig & SIG_MASK) << SIG_SHIFT)
        | ((count & COUNT_MASK) << COUNT_SHIFT)
        | ((cellar as u64) << CELLAR_SHIFT)
}

/// Bump the change counter, keeping the other fields.
#[inline]
fn with_count_bumped(bmc: u64) -> u64 {
    pack_bmc(bitmap(bmc), sig(bmc), count(bmc).wrapping_add(1), cellar_bit(bmc))
}

#[inline]
fn hash_to_sig(hash: u64) -> u64 {
    (hash >> 16) & SIG_MASK
}

/// Key comparison contract for hopscotch elements.
pub trait HopscotchEntry {
    type Key: ?Sized;
    fn key_matches(&self, key: &Self::Key) -> bool;
}

struct Cell {
    hash: AtomicU64,
    elem: AtomicPtr<()>,
}

/// Hopscotch hash table of `NonNull<E>` elements.
pub struct Hopscotch<E: HopscotchEntry> {
    nbkts: usize,
    ncells: usize,
    use_hp: bool,
    buckets: Box<[AtomicU128]>,
    cellar: Box<[Cell]>,
    _marker: PhantomData<*mut E>,
}

unsafe impl<E: HopscotchEntry> Send for Hopscotch<E> {}
unsafe impl<E: HopscotchEntry> Sync for Hopscotch<E> {}

impl<E: HopscotchEntry> Hopscotch<E> {
    /// Allocate a table of `nbkts` buckets and `ncells` cellar cells.
    pub fn new(nbkts: usize, ncells: usize, smr: Smr) -> Option<Self> {
        if nbkts < BITMAP_BITS {
            errhnd::report("hopscotch", "invalid number of elements", nbkts);
            return None;
        }
        Some(Self {
            nbkts,
            ncells,
            use_hp: smr.use_hp(),
            buckets: (0..nbkts).map(|_| AtomicU128::new(0)).collect(),
            cellar: (0..ncells)
                .map(|_| Cell {
                    hash: AtomicU64::new(0),
                    elem: AtomicPtr::new(std::ptr::null_mut()),
                })
                .collect(),
            _marker: PhantomData,
        })
    }

    /// Pin the element of bucket `idx` through `hp` in HP mode.
    fn load_elem(&self, idx: usize, hp: &mut Hazard) -> usize {
        if self.use_hp {
            crate::hazptr::acquire_with(hp, !0, |mo| elem_of(self.buckets[idx].load(mo)))
        } else {
            elem_of(self.buckets[idx].load(Ordering::Acquire))
        }
    }

    fn load_cell_elem(&self, idx: usize, hp: &mut Hazard) -> usize {
        if self.use_hp {
            crate::hazptr::acquire_with(hp, !0, |mo| self.cellar[idx].elem.load(mo) as usize)
        } else {
            self.cellar[idx].elem.load(Ordering::Acquire) as usize
        }
    }

    /// Look up by key and hash. In HP mode the hazard stays set on the
    /// returned element; in QSBR mode the caller brackets the call.
    pub fn lookup(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        let bix = ring_mod(hash, self.nbkts);
        let mut cur = bmc_of(self.buckets[bix].load(Ordering::Acquire));
        let mut bm = bitmap(cur);
        while bm != 0 {
            let bit = bm.trailing_zeros() as usize;
            let idx = ring_add(bix, bit, self.nbkts);
            let elem = self.load_elem(idx, hp);
            let elem_bmc = bmc_of(self.buckets[idx].load(Ordering::Relaxed));
            if elem != 0
                && sig(elem_bmc) == hash_to_sig(hash)
                && unsafe { &*(elem as *const E) }.key_matches(key)
            {
                // Found it; keep the hazard set.
                return Some(unsafe { NonNull::new_unchecked(elem as *mut E) });
            }
            // False positive, or the element was just moved/removed.
            bm &= bm - 1;
            if bm == 0 {
                // Re-check that the bmc did not change under us.
                fence(Ordering::Acquire);
                let fresh = bmc_of(self.buckets[bix].load(Ordering::Relaxed));
                if count(fresh) != count(cur) {
                    // Restart with a fresh bitmap.
                    cur = fresh;
                    bm = bitmap(cur);
                    fence(Ordering::Acquire);
                }
            }
        }
        if cellar_bit(cur) {
            if let Some(found) = self.search_cellar(key, hash, hp) {
                return Some(found);
            }
        }
        None
    }

    fn search_cellar(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        if self.ncells == 0 {
            return None;
        }
        let start = ring_mod(hash, self.ncells);
        let mut idx = start;
        loop {
            if self.cellar[idx].hash.load(Ordering::Relaxed) == hash {
                let elem = self.load_cell_elem(idx, hp);
                if elem != 0 && unsafe { &*(elem as *const E) }.key_matches(key) {
                    return Some(unsafe { NonNull::new_unchecked(elem as *mut E) });
                }
            }
            idx = ring_add(idx, 1, self.ncells);
            if idx == start {
                return None;
            }
        }
    }

    /// Insert an element under `hash`. Returns false when both the
    /// neighbourhood and the cellar are full.
    ///
    /// # Safety
    ///
    /// `elem` must stay valid while linked and must not already be present.
    pub unsafe fn insert(&self, elem: NonNull<E>, hash: u64) -> bool {
        smr::enter(self.use_hp);
        let mut success = self.insert_bkt(elem.as_ptr() as usize, hash);
        if !success {
            success = self.insert_cell(elem.as_ptr() as usize, hash);
        }
        smr::leave(self.use_hp);
        success
    }

    /// CAS an element into an empty bucket, updating bitmap/sig/count in
    /// the same 128-bit write.
    fn write_elem(&self, idx: usize, elem: usize, sig_val: u64, home_bkt: bool, rls: bool) -> bool {
        let bkt = &self.buckets[idx];
        let mut old = bkt.load(Ordering::Relaxed);
        loop {
            if elem_of(old) != 0 {
                // Slot not empty any more.
                return false;
            }
            let ob = bmc_of(old);
            let new_bmc = pack_bmc(
                bitmap(ob) | home_bkt as u64,
                sig_val,
                count(ob).wrapping_add(home_bkt as u64),
                cellar_bit(ob),
            );
            let order = if rls { Ordering::Release } else { Ordering::Relaxed };
            match bkt.compare_exchange(old, pack(new_bmc, elem), order, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(cur) => old = cur,
            }
        }
    }

    fn find_empty_bkt(&self, bix: usize) -> Option<usize> {
        let mut idx = bix;
        loop {
            if elem_of(self.buckets[idx].load(Ordering::Relaxed)) == 0 {
                return Some(idx);
            }
            idx = ring_add(idx, 1, self.nbkts);
            if idx == bix {
                return None;
            }
        }
    }

    /// Find a bucket whose first neighbourhood element sits before `empty`
    /// and can therefore be moved into it.
    fn find_move_candidate(&self, empty: usize) -> Option<(usize, u64, usize)> {
        for i in (1..BITMAP_BITS).rev() {
            let bix = ring_sub(empty, i, self.nbkts);
            let bmc = bmc_of(self.buckets[bix].load(Ordering::Acquire));
            if bitmap(bmc) != 0 {
                let bit = bitmap(bmc).trailing_zeros() as usize;
                let dist_b2e = ring_sub(empty, bix, self.nbkts);
                if bit < dist_b2e {
                    return Some((bix, bmc, ring_add(bix, bit, self.nbkts)));
                }
                // Else every set bit is at or after the empty bucket.
            }
        }
        None
    }

    /// Move one element into the empty bucket, producing a new empty
    /// bucket closer to home. On success `empty` is updated.
    fn move_elem(&self, empty: &mut usize) -> MoveResult {
        let dst_idx = *empty;
        loop {
            let Some((home_bix, home_bmc, src_idx)) = self.find_move_candidate(dst_idx) else {
                return MoveResult::Full;
            };
            // Copy the source element into the empty bucket.
            let src = self.buckets[src_idx].load(Ordering::Relaxed);
            if !self.write_elem(dst_idx, elem_of(src), sig(bmc_of(src)), false, false) {
                return MoveResult::DstTaken;
            }
            // Update the home bitmap to reflect the move.
            let src_bit = ring_sub(src_idx, home_bix, self.nbkts);
            let dst_bit = ring_sub(dst_idx, home_bix, self.nbkts);
            debug_assert!(src_bit < BITMAP_BITS && dst_bit < BITMAP_BITS && dst_bit > src_bit);
            let new_bitmap = (bitmap(home_bmc) & !(1 << src_bit)) | 1 << dst_bit;
            let new_bmc = pack_bmc(
                new_bitmap,
                sig(home_bmc),
                count(home_bmc).wrapping_add(1),
                cellar_bit(home_bmc),
            );
            if self
                .cas_bmc(home_bix, home_bmc, new_bmc, Ordering::Release)
                .is_ok()
            {
                // Moved; clear the source bucket's element.
                self.clear_elem(src_idx);
                *empty = src_idx;
                return MoveResult::Ok;
            }
            // Home bitmap changed; our element may have been moved. Undo.
            self.clear_elem(dst_idx);
        }
    }

    /// CAS only the bmc half of a bucket, keeping whatever element is
    /// present.
    fn cas_bmc(&self, idx: usize, old_bmc: u64, new_bmc: u64, order: Ordering) -> Result<(), u64> {
        let bkt = &self.buckets[idx];
        let mut old = bkt.load(Ordering::Relaxed);
        loop {
            if bmc_of(old) != old_bmc {
                return Err(bmc_of(old));
            }
            match bkt.compare_exchange(
                old,
                pack(new_bmc, elem_of(old)),
                order,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(cur) => old = cur,
            }
        }
    }

    /// Clear a bucket's element, keeping its bmc.
    fn clear_elem(&self, idx: usize) {
        let bkt = &self.buckets[idx];
        let mut old = bkt.load(Ordering::Relaxed);
        loop {
            match bkt.compare_exchange(
                old,
                pack(bmc_of(old), 0),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }
    }

    fn insert_bkt(&self, elem: usize, hash: u64) -> bool {
        let bix = ring_mod(hash, self.nbkts);
        loop {
            let Some(mut empty) = self.find_empty_bkt(bix) else {
                return false;
            };
            let mut retry = false;
            while ring_sub(empty, bix, self.nbkts) >= BITMAP_BITS {
                // The empty bucket is outside the neighbourhood; hop it
                // closer.
                match self.move_elem(&mut empty) {
                    MoveResult::Full => return false,
                    MoveResult::DstTaken => {
                        retry = true;
                        break;
                    }
                    MoveResult::Ok => (),
                }
            }
            if retry {
                continue;
            }
            debug_assert!(ring_sub(empty, bix, self.nbkts) < BITMAP_BITS);
            if !self.write_elem(empty, elem, hash_to_sig(hash), empty == bix, true) {
                continue;
            }
            if empty != bix {
                self.bitmap_set_mask(bix, empty);
            }
            return true;
        }
    }

    /// Mark bucket `idx` as holding an element homed at `bix`.
    fn bitmap_set_mask(&self, bix: usize, idx: usize) {
        let bit = ring_sub(idx, bix, self.nbkts);
        debug_assert!(bit < BITMAP_BITS);
        loop {
            let old = bmc_of(self.buckets[bix].load(Ordering::Relaxed));
            debug_assert_eq!(bitmap(old) & (1 << bit), 0);
            let new = pack_bmc(
                bitmap(old) | 1 << bit,
                sig(old),
                count(old).wrapping_add(1),
                cellar_bit(old),
            );
            if self.cas_bmc(bix, old, new, Ordering::Release).is_ok() {
                return;
            }
        }
    }

    fn insert_cell(&self, elem: usize, hash: u64) -> bool {
        if self.ncells == 0 {
            return false;
        }
        let start = ring_mod(hash, self.ncells);
        let mut idx = start;
        loop {
            let cell = &self.cellar[idx];
            if cell.elem.load(Ordering::Relaxed).is_null()
                && cell
                    .elem
                    .compare_exchange(
                        std::ptr::null_mut(),
                        elem as *mut (),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                cell.hash.store(hash, Ordering::Relaxed);
                // Flag the home bucket so lookups also probe the cellar.
                let bix = ring_mod(hash, self.nbkts);
                loop {
                    let old = bmc_of(self.buckets[bix].load(Ordering::Relaxed));
                    let new = pack_bmc(bitmap(old), sig(old), count(old).wrapping_add(1), true);
                    if self.cas_bmc(bix, old, new, Ordering::Release).is_ok() {
                        break;
                    }
                }
                return true;
            }
            idx = ring_add(idx, 1, self.ncells);
            if idx == start {
                return false;
            }
        }
    }

    /// Remove a specific element. Returns false when it is not present.
    pub fn remove(&self, elem: NonNull<E>, hash: u64) -> bool {
        smr::enter(self.use_hp);
        let mut success = self.remove_bkt_by_ptr(elem.as_ptr() as usize, hash);
        if !success {
            success = self.remove_cell_by_ptr(elem.as_ptr() as usize, hash);
        }
        smr::leave(self.use_hp);
        success
    }

    fn remove_bkt_by_ptr(&self, rem_elem: usize, hash: u64) -> bool {
        let bix = ring_mod(hash, self.nbkts);
        let mut cur = bmc_of(self.buckets[bix].load(Ordering::Acquire));
        loop {
            let mut bm = bitmap(cur);
            while bm != 0 {
                let bit = bm.trailing_zeros() as usize;
                let idx = ring_add(bix, bit, self.nbkts);
                if elem_of(self.buckets[idx].load(Ordering::Relaxed)) == rem_elem {
                    // Clear the bit in the home bitmap first.
                    let new = pack_bmc(
                        bitmap(cur) & !(1 << bit),
                        sig(cur),
                        count(cur).wrapping_add(1),
                        cellar_bit(cur),
                    );
                    if self.cas_bmc(bix, cur, new, Ordering::Release).is_ok() {
                        // Then clear the bucket itself.
                        self.clear_elem(idx);
                        return true;
                    }
                    // Bitmap changed, quit the inner loop early.
                    break;
                }
                bm &= bm - 1;
            }
            let prev_count = count(cur);
            fence(Ordering::Acquire);
            cur = bmc_of(self.buckets[bix].load(Ordering::Acquire));
            if count(cur) == prev_count {
                return false;
            }
        }
    }

    fn remove_cell_by_ptr(&self, elem: usize, hash: u64) -> bool {
        if self.ncells == 0 {
            return false;
        }
        let start = ring_mod(hash, self.ncells);
        let mut idx = start;
        loop {
            let cell = &self.cellar[idx];
            if cell.elem.load(Ordering::Relaxed) as usize == elem
                && cell
                    .elem
                    .compare_exchange(
                        elem as *mut (),
                        std::ptr::null_mut(),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                // The hash value stays behind to avoid racing an insert.
                self.bitmap_update_cellar(ring_mod(hash, self.nbkts));
                return true;
            }
            idx = ring_add(idx, 1, self.ncells);
            if idx == start {
                return false;
            }
        }
    }

    /// Recompute the cellar bit of bucket `bix` after a cellar removal.
    fn bitmap_update_cellar(&self, bix: usize) {
        loop {
            let old = bmc_of(self.buckets[bix].load(Ordering::Acquire));
            let mut has_overflow = false;
            for cell in self.cellar.iter() {
                let hash = cell.hash.load(Ordering::Relaxed);
                let elem = cell.elem.load(Ordering::Relaxed);
                if !elem.is_null() && ring_mod(hash, self.nbkts) == bix {
                    has_overflow = true;
                    break;
                }
            }
            if has_overflow == cellar_bit(old) {
                return;
            }
            let new = pack_bmc(
                bitmap(old),
                sig(old),
                count(old).wrapping_add(1),
                has_overflow,
            );
            if self.cas_bmc(bix, old, new, Ordering::Release).is_ok() {
                return;
            }
        }
    }

    /// Remove and return the element matching `key`. In HP mode the hazard
    /// stays set on the returned element.
    pub fn remove_by_key(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        smr::enter(self.use_hp);
        let mut elem = self.remove_bkt_by_key(key, hash, hp);
        if elem.is_none() {
            elem = self.remove_cell_by_key(key, hash, hp);
        }
        smr::leave(self.use_hp);
        elem
    }

    fn remove_bkt_by_key(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        let bix = ring_mod(hash, self.nbkts);
        let mut cur = bmc_of(self.buckets[bix].load(Ordering::Acquire));
        loop {
            let mut bm = bitmap(cur);
            while bm != 0 {
                let bit = bm.trailing_zeros() as usize;
                let idx = ring_add(bix, bit, self.nbkts);
                let elem_bmc = bmc_of(self.buckets[idx].load(Ordering::Relaxed));
                let elem = self.load_elem(idx, hp);
                if elem != 0
                    && sig(elem_bmc) == hash_to_sig(hash)
                    && unsafe { &*(elem as *const E) }.key_matches(key)
                {
                    let new = pack_bmc(
                        bitmap(cur) & !(1 << bit),
                        sig(cur),
                        count(cur).wrapping_add(1),
                        cellar_bit(cur),
                    );
                    if self.cas_bmc(bix, cur, new, Ordering::Relaxed).is_ok() {
                        self.clear_elem(idx);
                        return Some(unsafe { NonNull::new_unchecked(elem as *mut E) });
                    }
                    break;
                }
                bm &= bm - 1;
            }
            let prev_count = count(cur);
            fence(Ordering::Acquire);
            cur = bmc_of(self.buckets[bix].load(Ordering::Acquire));
            if count(cur) == prev_count {
                smr::ptr_release(self.use_hp, hp);
                return None;
            }
        }
    }

    fn remove_cell_by_key(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        if self.ncells == 0 {
            return None;
        }
        let start = ring_mod(hash, self.ncells);
        let mut idx = start;
        loop {
            if self.cellar[idx].hash.load(Ordering::Acquire) == hash {
                let elem = self.load_cell_elem(idx, hp);
                if elem != 0 && unsafe { &*(elem as *const E) }.key_matches(key) {
                    if self.cellar[idx]
                        .elem
                        .compare_exchange(
                            elem as *mut (),
                            std::ptr::null_mut(),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        self.bitmap_update_cellar(ring_mod(hash, self.nbkts));
                        return Some(unsafe { NonNull::new_unchecked(elem as *mut E) });
                    }
                    // Cell changed under us; the element was removed.
                }
            }
            idx = ring_add(idx, 1, self.ncells);
            if idx == start {
                smr::ptr_release(self.use_hp, hp);
                return None;
            }
        }
    }

    /// Visit every element. Cellar indices have [`CELLAR_INDEX_BIT`] set.
    pub fn traverse(&self, mut cb: impl FnMut(NonNull<E>, usize)) {
        let mut hp = Hazard::null();
        for idx in 0..self.nbkts {
            let elem = self.load_elem(idx, &mut hp);
            if elem != 0 {
                smr::enter(self.use_hp);
                cb(unsafe { NonNull::new_unchecked(elem as *mut E) }, idx);
                smr::leave(self.use_hp);
            }
            smr::ptr_release(self.use_hp, &mut hp);
        }
        for idx in 0..self.ncells {
            let elem = self.load_cell_elem(idx, &mut hp);
            if elem != 0 {
                smr::enter(self.use_hp);
                cb(
                    unsafe { NonNull::new_unchecked(elem as *mut E) },
                    idx | CELLAR_INDEX_BIT,
                );
                smr::leave(self.use_hp);
            }
            smr::ptr_release(self.use_hp, &mut hp);
        }
    }
}

/// Set on traverse indices that refer to the cellar.
pub const CELLAR_INDEX_BIT: usize = 1 << (usize::BITS - 1);

enum MoveResult {
    Full,
    DstTaken,
    Ok,
}

impl<E: HopscotchEntry> Drop for Hopscotch<E> {
    fn drop(&mut self) {
        for bkt in self.buckets.iter() {
            let word = bkt.load(Ordering::Relaxed);
            if elem_of(word) != 0 || bitmap(bmc_of(word)) != 0 {
                errhnd::report("hopscotch", "hash table not empty", 0);
                return;
            }
        }
        for cell in self.cellar.iter() {
            if !cell.elem.load(Ordering::Relaxed).is_null() {
                errhnd::report("hopscotch", "hash table not empty", 0);
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

    struct Item {
        key: u64,
    }

    impl HopscotchEntry for Item {
        type Key = u64;
        fn key_matches(&self, key: &u64) -> bool {
            self.key == *key
        }
    }

    fn item(key: u64) -> NonNull<Item> {
        NonNull::from(Box::leak(Box::new(Item { key })))
    }

    #[test]
    fn insert_lookup_remove() {
        let dom = HpDomain::new(64, 8).unwrap();
        hazptr::register(&dom);
        // 24 buckets, no cellar, everything hashes to 0.
        let ht: Hopscotch<Item> = Hopscotch::new(24, 0, Smr::HazardPointers).unwrap();
        let a = item(242);
        let b = item(243);
        assert!(unsafe { ht.insert(a, 0) });
        assert!(unsafe { ht.insert(b, 0) });

        let mut hp = Hazard::null();
        let found = ht.lookup(&242, 0, &mut hp).unwrap();
        assert_eq!(found, a);
        hazptr::release(&mut hp);
        assert!(ht.lookup(&244, 0, &mut hp).is_none());
        hazptr::release(&mut hp);

        assert!(ht.remove(a, 0));
        assert!(ht.lookup(&242, 0, &mut hp).is_none());
        hazptr::release(&mut hp);

        assert!(ht.remove(b, 0));
        drop(unsafe { Box::from_raw(a.as_ptr()) });
        drop(unsafe { Box::from_raw(b.as_ptr()) });
        hazptr::unregister();
    }

    #[test]
    fn overflow_into_cellar() {
        let dom = HpDomain::new(64, 8).unwrap();
        hazptr::register(&dom);
        let ht: Hopscotch<Item> = Hopscotch::new(24, 8, Smr::HazardPointers).unwrap();
        // More colliding elements than the neighbourhood can hold; the
        // table has 24 buckets so the surplus must land in the cellar.
        let items: Vec<_> = (0..26).map(|k| item(k)).collect();
        let mut inserted = 0;
        for it in &items {
            if unsafe { ht.insert(*it, 0) } {
                inserted += 1;
            }
        }
        assert!(inserted > BITMAP_BITS);

        let mut hp = Hazard::null();
        for (k, it) in items.iter().enumerate().take(inserted) {
            let found = ht.lookup(&(k as u64), 0, &mut hp).unwrap();
            assert_eq!(found, *it);
            hazptr::release(&mut hp);
        }

        let mut count = 0;
        ht.traverse(|_, _| count += 1);
        assert_eq!(count, inserted);

        for it in items.iter().take(inserted) {
            assert!(ht.remove(*it, 0));
        }
        for it in items {
            drop(unsafe { Box::from_raw(it.as_ptr()) });
        }
        hazptr::unregister();
    }

    #[test]
    fn remove_by_key_from_cellar() {
        let dom = HpDomain::new(64, 8).unwrap();
        hazptr::register(&dom);
        let ht: Hopscotch<Item> = Hopscotch::new(24, 4, Smr::HazardPointers).unwrap();
        let items: Vec<_> = (0..25).map(|k| item(k)).collect();
        for it in &items {
            assert!(unsafe { ht.insert(*it, 0) });
        }
        let mut hp = Hazard::null();
        // The last insert overflowed; remove it by key.
        let got = ht.remove_by_key(&24, 0, &mut hp).unwrap();
        assert_eq!(got, items[24]);
        hazptr::release(&mut hp);
        for it in items.iter().take(24) {
            assert!(ht.remove(*it, 0));
        }
        for it in items {
            drop(unsafe { Box::from_raw(it.as_ptr()) });
        }
        hazptr::unregister();
    }
}
