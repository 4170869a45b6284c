/*!
Lock-free hash table with separate chaining.

Buckets are cache lines of `(next, hash)` head pairs; an element whose hash
lands in a bucket is linked either directly from a head slot or into the
overflow list rooted at slot `hash % BKT_SIZE`. Every `(next, hash)` pair is
one 128-bit word so readers always observe a coherent pointer/hash pair.

Removal is logical-then-physical: the victim's own `next` gets its low bit
marked, then the parent pair is swung past the victim with one 128-bit CAS
that also installs the victim's `(next, hash)`. Any thread that encounters a
marked successor helps finish the unlink.

Elements are user-owned nodes implementing [`HashEntry`]; the table never
copies payload and never frees elements (retire removed elements through
the active SMR scheme).
*/

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;

use crate::errhnd;
use crate::hazptr::{self, Hazard};
use crate::smr::{self, Smr};
use crate::CACHE_LINE;

/// Elements per bucket: a cache line of `(next, hash)` pairs.
pub const BKT_SIZE: usize = CACHE_LINE / (2 * std::mem::size_of::<usize>());

const MARK_REMOVE: usize = 1;

#[inline]
fn has_mark(ptr: usize) -> bool {
    ptr & MARK_REMOVE != 0
}

#[inline]
fn rem_mark(ptr: usize) -> usize {
    ptr & !MARK_REMOVE
}

#[inline]
fn next_of(pair: u128) -> usize {
    pair as u64 as usize
}

#[inline]
fn hash_of(pair: u128) -> u64 {
    (pair >> 64) as u64
}

#[inline]
fn pack(next: usize, hash: u64) -> u128 {
    ((hash as u128) << 64) | next as u64 as u128
}

/// Intrusive link: the element's `(next, hash)` pair. Embed one per
/// element.
pub struct HashLink {
    pair: AtomicU128,
}

impl HashLink {
    pub const fn new() -> Self {
        Self {
            pair: AtomicU128::new(0),
        }
    }
}

impl Default for HashLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract between the table and its elements.
///
/// # Safety
///
/// `link` must return the same embedded link for the lifetime of the
/// element, and the element must stay valid while linked (and, after
/// removal, until reclaimed through the SMR scheme).
pub unsafe trait HashEntry: Sized {
    type Key: ?Sized;

    /// The embedded link.
    fn link(&self) -> &HashLink;

    /// Full key comparison, used after the hash matched.
    fn key_matches(&self, key: &Self::Key) -> bool;
}

struct Bucket {
    elems: [HashLink; BKT_SIZE],
}

/// Separate-chaining hash table of intrusive [`HashEntry`] elements.
pub struct HashTable<E: HashEntry> {
    nbkts: usize,
    use_hp: bool,
    buckets: Box<[Bucket]>,
    _marker: PhantomData<*mut E>,
}

unsafe impl<E: HashEntry> Send for HashTable<E> {}
unsafe impl<E: HashEntry> Sync for HashTable<E> {}

impl<E: HashEntry> HashTable<E> {
    /// Allocate a table with room for roughly `nelems` elements in the
    /// bucket heads.
    pub fn new(nelems: usize, smr: Smr) -> Option<Self> {
        if nelems == 0 {
            errhnd::report("hashtable", "invalid number of elements", 0);
            return None;
        }
        let nbkts = nelems.div_ceil(BKT_SIZE);
        let buckets = (0..nbkts)
            .map(|_| Bucket {
                elems: [(); BKT_SIZE].map(|_| HashLink::new()),
            })
            .collect();
        Some(Self {
            nbkts,
            use_hp: smr.use_hp(),
            buckets,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn hash_to_bix(&self, hash: u64) -> usize {
        ((hash as usize) / BKT_SIZE) % self.nbkts
    }

    /// Load a parent's next pointer with acquire semantics, pinning it in
    /// HP mode. Returns the raw (possibly marked) value.
    fn load_next(&self, prnt: &HashLink, hp: &mut Hazard) -> usize {
        if self.use_hp {
            hazptr::acquire_with(hp, !MARK_REMOVE, |mo| next_of(prnt.pair.load(mo)))
        } else {
            next_of(prnt.pair.load(Ordering::Acquire))
        }
    }

    /// Swing `prnt` past `this`, which must already carry the removal mark
    /// on its own next pointer. True when `this` is unlinked (by us or
    /// anyone); false when the parent itself is marked for removal.
    fn remove_node(prnt: &HashLink, this: NonNull<E>, hash: u64) -> bool {
        let this_usize = this.as_ptr() as usize;
        debug_assert!(!has_mark(this_usize));
        // Set our removal mark (it may already be set); nobody may update
        // our next pointer from here on and other threads may help.
        let prev = unsafe { this.as_ref() }
            .link()
            .pair
            .fetch_or(MARK_REMOVE as u128, Ordering::Relaxed);
        let new = pack(rem_mark(next_of(prev)), hash_of(prev));
        // Expect prnt -> this unmarked; install this's (next, hash).
        match prnt
            .pair
            .compare_exchange(pack(this_usize, hash), new, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => true,
            Err(cur) => {
                // Parent no longer points at `this`: already removed.
                // Otherwise the parent carries the removal mark itself.
                rem_mark(next_of(cur)) != this_usize
            }
        }
    }

    /// CAS a `(null, 0)` parent pair to `(he, hash)`. None on success,
    /// otherwise the unexpected next value.
    fn insert_node(prnt: &HashLink, he: usize, hash: u64) -> Option<usize> {
        match prnt
            .pair
            .compare_exchange(pack(0, 0), pack(he, hash), Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => None,
            Err(cur) => Some(next_of(cur)),
        }
    }

    /// Insert an element under `hash`.
    ///
    /// # Safety
    ///
    /// `he` must not be linked into any table and must stay valid while
    /// linked.
    pub unsafe fn insert(&self, he: NonNull<E>, hash: u64) {
        if has_mark(he.as_ptr() as usize) {
            errhnd::report("hashtable", "element has low bits set", he.as_ptr() as usize);
            return;
        }
        smr::enter(self.use_hp);
        let bkt = &self.buckets[self.hash_to_bix(hash)];
        unsafe { he.as_ref() }.link().pair.store(0, Ordering::Relaxed);
        if !Self::bucket_insert(bkt, he.as_ptr() as usize, hash) {
            self.list_insert(&bkt.elems[hash as usize % BKT_SIZE], he, hash);
        }
        smr::leave(self.use_hp);
    }

    fn bucket_insert(bkt: &Bucket, he: usize, hash: u64) -> bool {
        for slot in &bkt.elems {
            if next_of(slot.pair.load(Ordering::Relaxed)) == 0
                && Self::insert_node(slot, he, hash).is_none()
            {
                return true;
            }
        }
        false
    }

    fn list_insert(&self, org: &HashLink, he: NonNull<E>, hash: u64) {
        let mut hpprnt = Hazard::null();
        let mut hpthis = Hazard::null();
        let mut prnt = org;
        loop {
            let this = rem_mark(self.load_next(prnt, &mut hpthis));
            if this == 0 {
                // End of list: try to swap our element in.
                match Self::insert_node(prnt, he.as_ptr() as usize, hash) {
                    None => break,
                    Some(old) => {
                        if has_mark(old) {
                            // Parent is marked for removal and must go
                            // first; restart from the bucket head.
                            prnt = org;
                        }
                        // Else another node took the slot; retry in place.
                        continue;
                    }
                }
            } else if this == he.as_ptr() as usize {
                errhnd::report("hashtable", "element already present", this);
                break;
            } else {
                let this_nn = unsafe { NonNull::new_unchecked(this as *mut E) };
                let this_pair = unsafe { this_nn.as_ref() }.link().pair.load(Ordering::Relaxed);
                if has_mark(next_of(this_pair)) {
                    // Successor is marked: lend a hand unlinking it.
                    let prnt_hash = hash_of(prnt.pair.load(Ordering::Relaxed));
                    if Self::remove_node(prnt, this_nn, prnt_hash) {
                        continue;
                    }
                    prnt = org;
                    continue;
                }
                // Continue the search.
                prnt = unsafe { &*(this as *const E) }.link();
                std::mem::swap(&mut hpprnt, &mut hpthis);
            }
        }
        smr::ptr_release(self.use_hp, &mut hpprnt);
        smr::ptr_release(self.use_hp, &mut hpthis);
    }

    /// Look up an element by key and hash. In HP mode the hazard stays set
    /// on the returned element until the caller releases it; in QSBR mode
    /// the caller must hold a read-side region around the call and use of
    /// the result.
    pub fn lookup(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        let bkt = &self.buckets[self.hash_to_bix(hash)];
        if let Some(he) = self.bucket_lookup(bkt, key, hash, hp) {
            return Some(he);
        }
        self.list_lookup(&bkt.elems[hash as usize % BKT_SIZE], key, hp)
    }

    fn bucket_lookup(
        &self,
        bkt: &Bucket,
        key: &E::Key,
        hash: u64,
        hp: &mut Hazard,
    ) -> Option<NonNull<E>> {
        for slot in &bkt.elems {
            if hash_of(slot.pair.load(Ordering::Relaxed)) != hash {
                continue;
            }
            let he = self.load_next(slot, hp);
            // Head pointers are never marked for removal.
            debug_assert_eq!(rem_mark(he), he);
            if he != 0 {
                let elem = unsafe { &*(he as *const E) };
                if elem.key_matches(key) {
                    return Some(unsafe { NonNull::new_unchecked(he as *mut E) });
                }
                // Else false positive on the hash.
            }
        }
        None
    }

    fn list_lookup(&self, org: &HashLink, key: &E::Key, hp: &mut Hazard) -> Option<NonNull<E>> {
        let mut hpprnt = Hazard::null();
        let mut prnt = org;
        loop {
            let this = rem_mark(self.load_next(prnt, hp));
            if this == 0 {
                smr::ptr_release(self.use_hp, &mut hpprnt);
                return None;
            }
            let elem = unsafe { &*(this as *const E) };
            if elem.key_matches(key) {
                smr::ptr_release(self.use_hp, &mut hpprnt);
                return Some(unsafe { NonNull::new_unchecked(this as *mut E) });
            }
            prnt = elem.link();
            std::mem::swap(&mut hpprnt, hp);
        }
    }

    /// Remove a specific element. Returns false when it was not found.
    ///
    /// # Safety
    ///
    /// `he` must be an element previously inserted under `hash` (or absent)
    /// and still valid.
    pub unsafe fn remove(&self, he: NonNull<E>, hash: u64) -> bool {
        smr::enter(self.use_hp);
        let bkt = &self.buckets[self.hash_to_bix(hash)];
        let mut success = Self::bucket_remove(bkt, he, hash);
        if !success {
            success = self.list_remove(&bkt.elems[hash as usize % BKT_SIZE], he, hash);
        }
        smr::leave(self.use_hp);
        success
    }

    fn bucket_remove(bkt: &Bucket, he: NonNull<E>, hash: u64) -> bool {
        for slot in &bkt.elems {
            if next_of(slot.pair.load(Ordering::Relaxed)) == he.as_ptr() as usize {
                // We already have a reference; cannot fail due to a marked
                // parent because head slots are never removed.
                Self::remove_node(slot, he, hash);
                return true;
            }
        }
        false
    }

    fn list_remove(&self, org: &HashLink, he: NonNull<E>, hash: u64) -> bool {
        let mut hpprnt = Hazard::null();
        let mut hpthis = Hazard::null();
        let mut prnt = org;
        let result = loop {
            let this = rem_mark(self.load_next(prnt, &mut hpthis));
            if this == 0 {
                break false;
            }
            let this_nn = unsafe { NonNull::new_unchecked(this as *mut E) };
            if this == he.as_ptr() as usize {
                if Self::remove_node(prnt, this_nn, hash) {
                    break true;
                }
                // Parent marked for removal: restart from the head.
                prnt = org;
                continue;
            }
            let this_pair = unsafe { this_nn.as_ref() }.link().pair.load(Ordering::Relaxed);
            if has_mark(next_of(this_pair)) {
                let prnt_hash = hash_of(prnt.pair.load(Ordering::Relaxed));
                if Self::remove_node(prnt, this_nn, prnt_hash) {
                    continue;
                }
                prnt = org;
                continue;
            }
            prnt = unsafe { &*(this as *const E) }.link();
            std::mem::swap(&mut hpprnt, &mut hpthis);
        };
        smr::ptr_release(self.use_hp, &mut hpprnt);
        smr::ptr_release(self.use_hp, &mut hpthis);
        result
    }

    /// Remove and return the element matching `key`. In HP mode the hazard
    /// stays set on the returned element.
    pub fn remove_by_key(&self, key: &E::Key, hash: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        let bkt = &self.buckets[self.hash_to_bix(hash)];
        if let Some(he) = self.bucket_remove_by_key(bkt, key, hash, hp) {
            return Some(he);
        }
        self.list_remove_by_key(&bkt.elems[hash as usize % BKT_SIZE], key, hash, hp)
    }

    fn bucket_remove_by_key(
        &self,
        bkt: &Bucket,
        key: &E::Key,
        hash: u64,
        hp: &mut Hazard,
    ) -> Option<NonNull<E>> {
        for slot in &bkt.elems {
            if hash_of(slot.pair.load(Ordering::Relaxed)) != hash {
                continue;
            }
            let he = self.load_next(slot, hp);
            debug_assert_eq!(rem_mark(he), he);
            if he != 0 {
                let elem_nn = unsafe { NonNull::new_unchecked(he as *mut E) };
                if unsafe { elem_nn.as_ref() }.key_matches(key) {
                    Self::remove_node(slot, elem_nn, hash);
                    return Some(elem_nn);
                }
            }
        }
        None
    }

    fn list_remove_by_key(
        &self,
        org: &HashLink,
        key: &E::Key,
        hash: u64,
        hp: &mut Hazard,
    ) -> Option<NonNull<E>> {
        let mut hpprnt = Hazard::null();
        let mut hpthis = Hazard::null();
        let mut prnt = org;
        let result = loop {
            let this = rem_mark(self.load_next(prnt, &mut hpthis));
            if this == 0 {
                break None;
            }
            let this_nn = unsafe { NonNull::new_unchecked(this as *mut E) };
            if unsafe { this_nn.as_ref() }.key_matches(key) {
                if Self::remove_node(prnt, this_nn, hash) {
                    // Hand the hazard on `this` to the caller.
                    std::mem::swap(hp, &mut hpthis);
                    break Some(this_nn);
                }
                prnt = org;
                continue;
            }
            let this_pair = unsafe { this_nn.as_ref() }.link().pair.load(Ordering::Relaxed);
            if has_mark(next_of(this_pair)) {
                let prnt_hash = hash_of(prnt.pair.load(Ordering::Relaxed));
                if Self::remove_node(prnt, this_nn, prnt_hash) {
                    continue;
                }
                prnt = org;
                continue;
            }
            prnt = unsafe { &*(this as *const E) }.link();
            std::mem::swap(&mut hpprnt, &mut hpthis);
        };
        smr::ptr_release(self.use_hp, &mut hpprnt);
        smr::ptr_release(self.use_hp, &mut hpthis);
        result
    }

    /// Visit every element; `cb` receives the element and its chain index.
    pub fn traverse(&self, mut cb: impl FnMut(NonNull<E>, usize)) {
        for (bix, bkt) in self.buckets.iter().enumerate() {
            for (i, slot) in bkt.elems.iter().enumerate() {
                self.traverse_list(slot, bix * BKT_SIZE + i, &mut cb);
            }
        }
    }

    fn traverse_list(&self, org: &HashLink, idx: usize, cb: &mut impl FnMut(NonNull<E>, usize)) {
        let mut hpprnt = Hazard::null();
        let mut hpthis = Hazard::null();
        smr::enter(self.use_hp);
        let mut prnt = org;
        loop {
            let this = rem_mark(self.load_next(prnt, &mut hpthis));
            if this == 0 {
                break;
            }
            let this_nn = unsafe { NonNull::new_unchecked(this as *mut E) };
            cb(this_nn, idx);
            prnt = unsafe { &*(this as *const E) }.link();
            std::mem::swap(&mut hpprnt, &mut hpthis);
        }
        smr::leave(self.use_hp);
        smr::ptr_release(self.use_hp, &mut hpprnt);
        smr::ptr_release(self.use_hp, &mut hpthis);
    }
}

impl<E: HashEntry> Drop for HashTable<E> {
    fn drop(&mut self) {
        for bkt in self.buckets.iter() {
            for slot in &bkt.elems {
                if next_of(slot.pair.load(Ordering::Relaxed)) != 0 {
                    errhnd::report("hashtable", "hash table not empty", 0);
                    return;
                }
            }
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazptr::HpDomain;

    struct Item {
        link: HashLink,
        key: u64,
    }

    unsafe impl HashEntry for Item {
        type Key = u64;
        fn link(&self) -> &HashLink {
            &self.link
        }
        fn key_matches(&self, key: &u64) -> bool {
            self.key == *key
        }
    }

    fn item(key: u64) -> NonNull<Item> {
        NonNull::from(Box::leak(Box::new(Item {
            link: HashLink::new(),
            key,
        })))
    }

    #[test]
    fn insert_lookup_remove_colliding() {
        let dom = HpDomain::new(64, 8).unwrap();
        hazptr::register(&dom);
        let ht: HashTable<Item> = HashTable::new(16, Smr::HazardPointers).unwrap();

        // All keys share hash 0 to force the overflow list.
        let items: Vec<_> = (0..8).map(item).collect();
        for it in &items {
            unsafe { ht.insert(*it, 0) };
        }

        let mut hp = Hazard::null();
        for k in 0..8u64 {
            let found = ht.lookup(&k, 0, &mut hp).unwrap();
            assert_eq!(unsafe { found.as_ref() }.key, k);
            hazptr::release(&mut hp);
        }
        assert!(ht.lookup(&99, 0, &mut hp).is_none());
        hazptr::release(&mut hp);

        let mut count = 0;
        ht.traverse(|_, _| count += 1);
        assert_eq!(count, 8);

        for it in &items {
            assert!(unsafe { ht.remove(*it, 0) });
        }
        for k in 0..8u64 {
            assert!(ht.lookup(&k, 0, &mut hp).is_none());
        }
        hazptr::release(&mut hp);

        for it in items {
            drop(unsafe { Box::from_raw(it.as_ptr()) });
        }
        hazptr::unregister();
    }

    #[test]
    fn remove_by_key_returns_element() {
        let dom = HpDomain::new(64, 8).unwrap();
        hazptr::register(&dom);
        let ht: HashTable<Item> = HashTable::new(8, Smr::HazardPointers).unwrap();
        let a = item(242);
        let b = item(243);
        unsafe {
            ht.insert(a, 7);
            ht.insert(b, 7);
        }
        let mut hp = Hazard::null();
        let got = ht.remove_by_key(&242, 7, &mut hp).unwrap();
        assert_eq!(got, a);
        hazptr::release(&mut hp);
        assert!(ht.remove_by_key(&242, 7, &mut hp).is_none());
        assert!(unsafe { ht.remove(b, 7) });
        drop(unsafe { Box::from_raw(a.as_ptr()) });
        drop(unsafe { Box::from_raw(b.as_ptr()) });
        hazptr::unregister();
    }

    #[test]
    fn qsbr_mode() {
        let dom = crate::qsbr::QsbrDomain::new(64).unwrap();
        crate::qsbr::register(&dom);
        let ht: HashTable<Item> = HashTable::new(8, Smr::Qsbr).unwrap();
        let a = item(1);
        unsafe { ht.insert(a, 1) };
        crate::qsbr::acquire();
        let mut hp = Hazard::null();
        let found = ht.lookup(&1, 1, &mut hp).unwrap();
        assert_eq!(unsafe { found.as_ref() }.key, 1);
        crate::qsbr::release();
        assert!(unsafe { ht.remove(a, 1) });
        drop(unsafe { Box::from_raw(a.as_ptr()) });
        crate::qsbr::unregister();
    }
}
