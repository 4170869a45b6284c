/*!
Multi-bit trie for longest-prefix matching.

The trie is configured with a list of strides summing to at most 64. Each
level is a `2^stride` vector of slots; a slot holds either a leaf (an
element pointer carrying the originating prefix length in its low six bits),
a tagged pointer to a child vector, or NULL meaning "the default prefix".

Inserting a prefix replaces every covered slot whose current occupant has a
shorter or equal prefix length (longer prefixes win) and counts one element
reference per occupied slot, so lookups return stable pointers: an element
is handed to the zero callback only when its last slot reference is gone.

A sub-vector whose slots all converged to one value is collapsed back into
that value. Collapsers serialise on a per-slot mutex bit and publish a
collapse-in-progress bit; an updater that touches the sub-vector clears the
bit, aborting the collapse.

Elements must be 64-byte aligned (`#[repr(align(64))]`) and embed an
[`MbtrieElem`].
*/

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::errhnd;
use crate::hazptr::{self, Hazard};
use crate::smr::{self, Smr};

/// Maximum number of strides.
pub const MAX_STRIDES: usize = 16;

/// Leaf alignment: the low six bits carry the prefix length.
const ALIGNMENT: usize = 64;

// Pointer points to a child vector.
const VECTOR_BIT: usize = 1 << 48;
// Some thread holds the collapse mutex for this sub-vector.
const MUTEX_BIT: usize = 1;
// A collapse of this sub-vector is in progress; updaters clear it.
const COLLAPSE_BIT: usize = 2;

const ALL_BITS: usize = VECTOR_BIT | (ALIGNMENT - 1);

#[inline]
fn is_vector(v: usize) -> bool {
    v & VECTOR_BIT != 0
}

#[inline]
fn is_mutex(v: usize) -> bool {
    v & MUTEX_BIT != 0
}

#[inline]
fn is_collapse(v: usize) -> bool {
    v & COLLAPSE_BIT != 0
}

#[inline]
fn clr_collapse(v: usize) -> usize {
    v & !COLLAPSE_BIT
}

#[inline]
fn clr_all(v: usize) -> usize {
    v & !ALL_BITS
}

#[inline]
fn has_any(v: usize) -> bool {
    v & ALL_BITS != 0
}

#[inline]
fn get_pfxlen(v: usize) -> u32 {
    (v % ALIGNMENT) as u32 + 1
}

#[inline]
fn set_pfxlen(v: usize, len: u32) -> usize {
    v + len as usize - 1
}

#[inline]
fn pfxlen_to_mask(len: u32) -> u64 {
    match len {
        0 => 0,
        64 => !0,
        _ => ((1u64 << len) - 1) << (64 - len),
    }
}

#[inline]
fn stride_to_nslots(stride: u8) -> usize {
    1 << stride
}

#[inline]
fn prefix_to_index(pfx: u64, stride: u8) -> usize {
    let mask = stride_to_nslots(stride) - 1;
    ((pfx >> (64 - stride as u32)) as usize) & mask
}

// -------------------------------------

/// Embedded per-element state: the slot reference counter.
pub struct MbtrieElem {
    refcnt: AtomicUsize,
}

impl MbtrieElem {
    pub const fn new() -> Self {
        Self {
            refcnt: AtomicUsize::new(0),
        }
    }
}

impl Default for MbtrieElem {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract between the trie and its elements.
///
/// # Safety
///
/// `elem` must return the same embedded state for the element's lifetime;
/// the element must be 64-byte aligned and stay valid while any slot
/// references it.
pub unsafe trait MbtrieEntry: Sized {
    fn elem(&self) -> &MbtrieElem;
}

// -------------------------------------

// Child vectors are raw allocations with a one-cache-line header holding
// the slot count, so the retire callback can reconstruct the layout.

fn vec_layout(nslots: usize) -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(
        ALIGNMENT + nslots * std::mem::size_of::<usize>(),
        ALIGNMENT,
    )
    .expect("vector layout")
}

fn alloc_vec_raw(nslots: usize, init: usize) -> *mut AtomicUsize {
    let layout = vec_layout(nslots);
    let base = unsafe { std::alloc::alloc(layout) };
    if base.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    unsafe { (base as *mut usize).write(nslots) };
    let body = unsafe { base.add(ALIGNMENT) } as *mut AtomicUsize;
    for i in 0..nslots {
        unsafe { body.add(i).write(AtomicUsize::new(init)) };
    }
    body
}

unsafe fn free_vec_raw(body: *mut ()) {
    let base = unsafe { (body as *mut u8).sub(ALIGNMENT) };
    let nslots = unsafe { *(base as *const usize) };
    unsafe { std::alloc::dealloc(base, vec_layout(nslots)) };
}

#[inline]
unsafe fn vec_slots<'a>(body: usize, nslots: usize) -> &'a [AtomicUsize] {
    unsafe { std::slice::from_raw_parts(body as *const AtomicUsize, nslots) }
}

// -------------------------------------

/// Multi-bit LPM trie.
pub struct Mbtrie<E: MbtrieEntry> {
    strides: [u8; MAX_STRIDES],
    nstrides: usize,
    maxlen: u32,
    use_hp: bool,
    default_pfx: AtomicUsize,
    base: Box<[AtomicUsize]>,
    zero_cb: fn(NonNull<E>),
    _marker: PhantomData<*mut E>,
}

unsafe impl<E: MbtrieEntry> Send for Mbtrie<E> {}
unsafe impl<E: MbtrieEntry> Sync for Mbtrie<E> {}

impl<E: MbtrieEntry> Mbtrie<E> {
    /// Create a trie with the given stride configuration. `zero_cb` runs
    /// when an element's last slot reference disappears.
    pub fn new(strides: &[u8], zero_cb: fn(NonNull<E>), smr: Smr) -> Option<Self> {
        let mut maxlen = 0u32;
        if strides.is_empty() || strides.len() > MAX_STRIDES {
            errhnd::report("mbtrie", "invalid stride config", strides.len());
            return None;
        }
        for &s in strides {
            if s == 0 || s >= 64 {
                errhnd::report("mbtrie", "invalid stride config", s as usize);
                return None;
            }
            maxlen += s as u32;
        }
        if maxlen > 64 {
            errhnd::report("mbtrie", "invalid stride config", maxlen as usize);
            return None;
        }
        let mut cfg = [0u8; MAX_STRIDES];
        cfg[..strides.len()].copy_from_slice(strides);
        let nslots = stride_to_nslots(strides[0]);
        Some(Self {
            strides: cfg,
            nstrides: strides.len(),
            maxlen,
            use_hp: smr.use_hp(),
            default_pfx: AtomicUsize::new(0),
            base: (0..nslots).map(|_| AtomicUsize::new(0)).collect(),
            zero_cb,
            _marker: PhantomData,
        })
    }

    // ---------------------------------

    fn increment_refcnt(&self, val: usize, n: usize) {
        debug_assert!(!is_vector(val));
        let elem = clr_all(val);
        if elem != 0 {
            unsafe { &*(elem as *const E) }
                .elem()
                .refcnt
                .fetch_add(n, Ordering::Relaxed);
        }
    }

    fn decrement_refcnt(&self, val: usize, n: usize) {
        debug_assert!(!is_vector(val));
        let elem = clr_all(val);
        if elem != 0 {
            let prev = unsafe { &*(elem as *const E) }
                .elem()
                .refcnt
                .fetch_sub(n, Ordering::Relaxed);
            if prev == n {
                (self.zero_cb)(unsafe { NonNull::new_unchecked(elem as *mut E) });
            }
        }
    }

    /// Allocate a child vector with every slot holding `init`, counting
    /// one reference per slot.
    fn alloc_vec(&self, depth: usize, init: usize) -> usize {
        debug_assert!(depth < self.nstrides);
        let nslots = stride_to_nslots(self.strides[depth]);
        self.increment_refcnt(init, nslots);
        alloc_vec_raw(nslots, init) as usize
    }

    /// Free a vector (recursively), dropping one reference per slot.
    /// Shared vectors are retired through the SMR scheme.
    fn free_vec(&self, depth: usize, body: usize, shared: bool) {
        debug_assert!(depth < self.nstrides);
        debug_assert!(!has_any(body));
        let nslots = stride_to_nslots(self.strides[depth]);
        let slots = unsafe { vec_slots(body, nslots) };
        // Batch ranges of identical slots into one refcount update.
        let mut last = 0;
        let mut last_val = slots[0].load(Ordering::Relaxed);
        for i in 1..=nslots {
            let val = if i < nslots {
                slots[i].load(Ordering::Relaxed)
            } else {
                !last_val // Force the final flush.
            };
            if val != last_val {
                if is_vector(last_val) {
                    for _ in last..i {
                        self.free_vec(depth + 1, clr_all(last_val), shared);
                    }
                } else {
                    self.decrement_refcnt(last_val, i - last);
                }
                last = i;
                last_val = val;
            }
        }
        if shared {
            unsafe { smr::retire_spin(self.use_hp, body as *mut (), free_vec_raw) };
        } else {
            unsafe { free_vec_raw(body as *mut ()) };
        }
    }

    /// True when every slot of the vector holds `elem`.
    fn check_vec(&self, depth: usize, body: usize, elem: usize) -> bool {
        let nslots = stride_to_nslots(self.strides[depth]);
        let slots = unsafe { vec_slots(body, nslots) };
        slots.iter().all(|s| s.load(Ordering::Relaxed) == elem)
    }

    // ---------------------------------

    fn load_slot(&self, slotp: &AtomicUsize, hp: &mut Hazard) -> usize {
        if self.use_hp {
            hazptr::acquire_with(hp, !ALL_BITS, |mo| slotp.load(mo))
        } else {
            slotp.load(Ordering::Acquire)
        }
    }

    /// Swing `slotp` from `cur` to `new`, moving the slot reference.
    fn swing_slot(&self, slotp: &AtomicUsize, cur: usize, new: usize) -> bool {
        // Count the new reference before publication.
        self.increment_refcnt(new, 1);
        if slotp
            .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.decrement_refcnt(cur, 1);
            true
        } else {
            self.decrement_refcnt(new, 1);
            false
        }
    }

    /// Verify a sub-vector is still installed, clearing any
    /// collapse-in-progress bit to abort the collapser.
    fn check_remains(slotp: &AtomicUsize, cur: usize) -> bool {
        debug_assert!(is_vector(cur));
        loop {
            let cur2 = slotp.load(Ordering::Relaxed);
            if clr_collapse(cur2) != clr_collapse(cur) {
                return false;
            }
            if !is_collapse(cur2) {
                return true;
            }
            // Collapse in progress: clear the bit, releasing our updates.
            if slotp
                .compare_exchange(cur2, clr_collapse(cur2), Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// The prefix covers this whole slot: replace matching occupants.
    #[allow(clippy::too_many_arguments)]
    fn update_slot(
        &self,
        depth: usize,
        slotp: &AtomicUsize,
        pfx: u64,
        pfxlen: u32,
        org_pfxlen: u32,
        old: usize,
        new: usize,
    ) {
        let mut hp = Hazard::null();
        loop {
            let cur = self.load_slot(slotp, &mut hp);
            if is_vector(cur) {
                // Update the sub-vector, then verify it is still in place.
                self.update_pfx(depth, clr_all(cur), pfx, pfxlen, org_pfxlen, old, new);
                fence(Ordering::SeqCst);
                if !Self::check_remains(slotp, cur) {
                    continue;
                }
                break;
            } else if clr_all(cur) == old {
                // Swap occurrences of `old` for `new` (or fill an empty
                // slot on insert).
                if !self.swing_slot(slotp, cur, new) {
                    continue;
                }
                break;
            } else if clr_all(cur) != clr_all(new) {
                // Slot occupied by something else: a longer (more
                // specific) new prefix replaces it.
                if new != 0 && org_pfxlen >= get_pfxlen(cur) {
                    if !self.swing_slot(slotp, cur, new) {
                        continue;
                    }
                }
                break;
            } else {
                break;
            }
        }
        smr::ptr_release(self.use_hp, &mut hp);
    }

    /// Collapse a sub-vector whose slots all converged to one value.
    fn collapse_vec(&self, depth: usize, slotp: &AtomicUsize) {
        let mut hp = Hazard::null();
        loop {
            let cur = self.load_slot(slotp, &mut hp);
            if cur == 0 || !is_vector(cur) {
                break;
            }
            let body = clr_all(cur);
            let elem = unsafe { vec_slots(body, 1) }[0].load(Ordering::Relaxed);
            if is_vector(elem) || !self.check_vec(depth + 1, body, elem) {
                break;
            }
            if is_mutex(cur) {
                // Another collapser owns the sub-vector.
                break;
            }
            debug_assert!(!is_collapse(cur));
            // Take the mutex and announce the collapse.
            if slotp
                .compare_exchange(
                    cur,
                    cur | MUTEX_BIT | COLLAPSE_BIT,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                break;
            }
            // Re-check now that updaters will clear the collapse bit.
            let elem = unsafe { vec_slots(body, 1) }[0].load(Ordering::Relaxed);
            if is_vector(elem) || !self.check_vec(depth + 1, body, elem) {
                slotp.store(cur, Ordering::Release);
                break;
            }
            self.increment_refcnt(elem, 1);
            if slotp
                .compare_exchange(
                    cur | MUTEX_BIT | COLLAPSE_BIT,
                    elem,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                // An updater cleared the collapse bit; undo and retry.
                slotp.store(cur, Ordering::Release);
                self.decrement_refcnt(elem, 1);
                continue;
            }
            // Collapsed: dispose of the previously shared vector.
            self.free_vec(depth + 1, body, true);
            break;
        }
        smr::ptr_release(self.use_hp, &mut hp);
    }

    /// The prefix covers a subset of one slot: descend through an
    /// indirection vector.
    #[allow(clippy::too_many_arguments)]
    fn update_vec(
        &self,
        depth: usize,
        slotp: &AtomicUsize,
        pfx: u64,
        pfxlen: u32,
        org_pfxlen: u32,
        old: usize,
        new: usize,
    ) {
        let mut hp = Hazard::null();
        loop {
            let cur = self.load_slot(slotp, &mut hp);
            if cur == 0 || !is_vector(cur) {
                // Leaf or empty: interpose a sub-vector seeded with the
                // current value.
                let body = self.alloc_vec(depth + 1, cur);
                if slotp
                    .compare_exchange(cur, body | VECTOR_BIT, Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    // The old leaf lost its direct slot reference.
                    self.decrement_refcnt(cur, 1);
                } else {
                    self.free_vec(depth + 1, body, false);
                }
                continue;
            }
            self.update_pfx(
                depth + 1,
                clr_all(cur),
                pfx << self.strides[depth],
                pfxlen - self.strides[depth] as u32,
                org_pfxlen,
                old,
                new,
            );
            fence(Ordering::SeqCst);
            if !Self::check_remains(slotp, cur) {
                continue;
            }
            break;
        }
        smr::ptr_release(self.use_hp, &mut hp);
    }

    #[allow(clippy::too_many_arguments)]
    fn update_pfx(
        &self,
        depth: usize,
        body: usize,
        pfx: u64,
        pfxlen: u32,
        org_pfxlen: u32,
        old: usize,
        new: usize,
    ) {
        debug_assert!(depth < self.nstrides);
        let stride = self.strides[depth];
        let nslots_total = stride_to_nslots(stride);
        let slots = unsafe { vec_slots(body, nslots_total) };
        if pfxlen <= stride as u32 {
            // The prefix covers one or more whole slots.
            let nslots = stride_to_nslots(stride - pfxlen as u8);
            let idx = prefix_to_index(pfx, stride);
            for i in 0..nslots {
                self.update_slot(
                    depth + 1,
                    &slots[idx + i],
                    pfx << stride,
                    0,
                    org_pfxlen,
                    old,
                    new,
                );
            }
        } else {
            debug_assert!(depth + 1 < self.nstrides);
            let idx = prefix_to_index(pfx, stride);
            self.update_vec(depth, &slots[idx], pfx, pfxlen, org_pfxlen, old, new);
            if new == 0 || get_pfxlen(new) < org_pfxlen {
                // Elements were removed or replaced below: the sub-vector
                // may now be collapsible.
                self.collapse_vec(depth, &slots[idx]);
            }
        }
    }

    fn replace_default(&self, new: usize) {
        debug_assert!(!has_any(new));
        let mut hp = Hazard::null();
        loop {
            let cur = self.load_slot(&self.default_pfx, &mut hp);
            if self.swing_slot(&self.default_pfx, cur, new) {
                break;
            }
        }
        smr::ptr_release(self.use_hp, &mut hp);
    }

    /// Insert `elem` for `pfx/pfxlen`; covered slots with shorter prefixes
    /// are taken over.
    ///
    /// # Safety
    ///
    /// `elem` must be 64-byte aligned and stay valid until its zero
    /// callback runs.
    pub unsafe fn insert(&self, pfx: u64, pfxlen: u32, elem: NonNull<E>) {
        unsafe { self.remove(pfx, pfxlen, None, Some(elem)) }
    }

    /// Replace every covered occurrence of `old` with `new` (`None` clears
    /// back to the default). `old == None` inserts `new`.
    ///
    /// # Safety
    ///
    /// As for [`Mbtrie::insert`]; `old`, if given, must have been inserted
    /// under this exact prefix.
    pub unsafe fn remove(
        &self,
        pfx: u64,
        pfxlen: u32,
        old: Option<NonNull<E>>,
        new: Option<NonNull<E>>,
    ) {
        let old_usize = old.map_or(0, |p| p.as_ptr() as usize);
        let new_usize = new.map_or(0, |p| p.as_ptr() as usize);
        if has_any(old_usize) {
            errhnd::report("mbtrie", "element has low bits set", old_usize);
            return;
        }
        if has_any(new_usize) {
            errhnd::report("mbtrie", "element has low bits set", new_usize);
            return;
        }
        if old_usize == 0 && new_usize == 0 {
            errhnd::report("mbtrie", "null element", 0);
            return;
        }
        if pfxlen > self.maxlen {
            errhnd::report("mbtrie", "prefix too long", pfxlen as usize);
            return;
        }
        if pfx & !pfxlen_to_mask(pfxlen) != 0 {
            errhnd::report("mbtrie", "prefix has unused bits set", pfx as usize);
            return;
        }
        smr::enter(self.use_hp);
        if pfxlen == 0 {
            // The zero-length prefix is the default ("default gateway").
            self.replace_default(new_usize);
        } else {
            // NULL slots stand for the default prefix; embed the prefix
            // length into every other new value.
            let new_emb = if new_usize == 0 || new_usize == self.default_pfx.load(Ordering::Relaxed)
            {
                0
            } else {
                set_pfxlen(new_usize, pfxlen)
            };
            // Pin both elements across the update.
            self.increment_refcnt(old_usize, 1);
            self.increment_refcnt(new_emb, 1);
            self.update_pfx(
                0,
                self.base.as_ptr() as usize,
                pfx,
                pfxlen,
                pfxlen,
                old_usize,
                new_emb,
            );
            self.decrement_refcnt(new_emb, 1);
            self.decrement_refcnt(old_usize, 1);
        }
        smr::leave(self.use_hp);
    }

    /// Longest-prefix lookup. In HP mode the hazard stays set on the
    /// returned element; in QSBR mode the caller brackets the call.
    pub fn lookup(&self, key: u64, hp: &mut Hazard) -> Option<NonNull<E>> {
        let mut hpprev = Hazard::null();
        let mut key = key;
        let mut depth = 0;
        let mut body = self.base.as_ptr() as usize;
        let result = loop {
            let stride = self.strides[depth];
            let slots = unsafe { vec_slots(body, stride_to_nslots(stride)) };
            let idx = prefix_to_index(key, stride);
            let mut ptr = self.load_slot(&slots[idx], hp);
            if !is_vector(ptr) {
                if clr_all(ptr) == 0 {
                    // NULL means the default prefix.
                    ptr = self.load_slot(&self.default_pfx, hp);
                }
                if self.use_hp {
                    hazptr::release_ro(&mut hpprev);
                }
                // The caller releases `hp`.
                break NonNull::new(clr_all(ptr) as *mut E);
            }
            body = clr_all(ptr);
            if self.use_hp {
                std::mem::swap(&mut hpprev, hp);
            }
            key <<= stride;
            depth += 1;
            if depth >= self.nstrides {
                errhnd::report("mbtrie", "internal error", key as usize);
                break None;
            }
        };
        result
    }

    /// Vector lookup exploiting memory-level parallelism; QSBR only. The
    /// returned bitmap flags the keys that found an element.
    pub fn lookup_vec(&self, keys: &mut [u64], results: &mut [Option<NonNull<E>>]) -> u64 {
        let num = keys.len();
        if num > 64 || results.len() < num {
            errhnd::report("mbtrie", "invalid vector size", num);
            return 0;
        }
        if self.use_hp {
            errhnd::report("mbtrie", "hazard pointers not supported", 0);
            return 0;
        }
        if num == 0 {
            return 0;
        }
        // First read all level-0 pointers to overlap the cache misses.
        let mut ptrs = [0usize; 64];
        let base = unsafe { vec_slots(self.base.as_ptr() as usize, stride_to_nslots(self.strides[0])) };
        for i in 0..num {
            ptrs[i] = base[prefix_to_index(keys[i], self.strides[0])].load(Ordering::Acquire);
        }
        let mut mask: u64 = if num == 64 { !0 } else { (1 << num) - 1 };
        let mut success: u64 = 0;
        let mut depth = 0;
        while mask != 0 {
            let mut next_mask = 0u64;
            let mut m = mask;
            while m != 0 {
                let i = m.trailing_zeros() as usize;
                let bit = 1u64 << i;
                m &= !bit;
                let ptr = ptrs[i];
                if is_vector(ptr) {
                    // Follow the pointer to the sub-vector.
                    next_mask |= bit;
                    keys[i] <<= self.strides[depth];
                    let stride = self.strides[depth + 1];
                    let slots = unsafe { vec_slots(clr_all(ptr), stride_to_nslots(stride)) };
                    ptrs[i] = slots[prefix_to_index(keys[i], stride)].load(Ordering::Acquire);
                } else {
                    let leaf = if ptr != 0 {
                        ptr
                    } else {
                        self.default_pfx.load(Ordering::Acquire)
                    };
                    if leaf != 0 {
                        results[i] = NonNull::new(clr_all(leaf) as *mut E);
                        success |= bit;
                    } else {
                        results[i] = None;
                    }
                }
            }
            mask = next_mask;
            depth += 1;
        }
        success
    }

    /// Visit every leaf. With `real_refs` only actual elements are
    /// reported (the default prefix once, under prefix length 0); without
    /// it, NULL slots report the default prefix per covered slot.
    pub fn traverse(&self, cb: &mut dyn FnMut(u64, u32, NonNull<E>, u32), real_refs: bool) {
        smr::enter(self.use_hp);
        if real_refs {
            let mut hp = Hazard::null();
            let def = self.load_slot(&self.default_pfx, &mut hp);
            if def != 0 {
                if let Some(nn) = NonNull::new(clr_all(def) as *mut E) {
                    cb(0, 0, nn, 0);
                }
            }
            smr::ptr_release(self.use_hp, &mut hp);
        }
        self.traverse_level(cb, real_refs, 0, self.base.as_ptr() as usize, 0, 0);
        smr::leave(self.use_hp);
    }

    fn traverse_level(
        &self,
        cb: &mut dyn FnMut(u64, u32, NonNull<E>, u32),
        real_refs: bool,
        depth: usize,
        body: usize,
        pfx: u64,
        pfxlen: u32,
    ) {
        let stride = self.strides[depth];
        let nslots = stride_to_nslots(stride);
        let slots = unsafe { vec_slots(body, nslots) };
        let sumstride: u32 = self.strides[..=depth].iter().map(|&s| s as u32).sum();
        let mut hp = Hazard::null();
        for (i, slot) in slots.iter().enumerate() {
            let pfx2 = pfx | ((i as u64) << (64 - sumstride));
            let pfxlen2 = pfxlen + stride as u32;
            let ptr = self.load_slot(slot, &mut hp);
            if is_vector(ptr) {
                self.traverse_level(cb, real_refs, depth + 1, clr_all(ptr), pfx2, pfxlen2);
            } else if ptr != 0 {
                if let Some(nn) = NonNull::new(clr_all(ptr) as *mut E) {
                    cb(pfx2, pfxlen2, nn, get_pfxlen(ptr));
                }
            } else if !real_refs {
                let mut hp2 = Hazard::null();
                let def = self.load_slot(&self.default_pfx, &mut hp2);
                if let Some(nn) = NonNull::new(clr_all(def) as *mut E) {
                    cb(pfx2, pfxlen2, nn, 0);
                }
                smr::ptr_release(self.use_hp, &mut hp2);
            }
        }
        smr::ptr_release(self.use_hp, &mut hp);
    }
}

impl<E: MbtrieEntry> Drop for Mbtrie<E> {
    fn drop(&mut self) {
        // Exclusive access: free sub-vectors immediately.
        for slot in self.base.iter() {
            let val = slot.load(Ordering::Relaxed);
            if is_vector(val) {
                self.free_vec(1, clr_all(val), false);
            } else if val != 0 {
                self.decrement_refcnt(val, 1);
            }
        }
        let def = self.default_pfx.load(Ordering::Relaxed);
        if def != 0 {
            self.decrement_refcnt(def, 1);
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qsbr::{self, QsbrDomain};
    use std::sync::atomic::AtomicU32;

    #[repr(align(64))]
    struct Route {
        elem: MbtrieElem,
        id: u32,
    }

    unsafe impl MbtrieEntry for Route {
        fn elem(&self) -> &MbtrieElem {
            &self.elem
        }
    }

    static FREED: AtomicU32 = AtomicU32::new(0);

    fn on_zero(_r: NonNull<Route>) {
        FREED.fetch_add(1, Ordering::Relaxed);
    }

    fn route(id: u32) -> NonNull<Route> {
        NonNull::from(Box::leak(Box::new(Route {
            elem: MbtrieElem::new(),
            id,
        })))
    }

    /// Left-aligned prefix from a bit string.
    fn pfx(bits: &str) -> u64 {
        let mut v = 0u64;
        for (i, c) in bits.chars().enumerate() {
            if c == '1' {
                v |= 1 << (63 - i);
            }
        }
        v
    }

    fn id_of(trie: &Mbtrie<Route>, key: u64) -> Option<u32> {
        let mut hp = Hazard::null();
        trie.lookup(key, &mut hp).map(|r| unsafe { r.as_ref() }.id)
    }

    #[test]
    fn longest_prefix_match() {
        let dom = QsbrDomain::new(256).unwrap();
        qsbr::register(&dom);
        let trie: Mbtrie<Route> = Mbtrie::new(&[4, 4], on_zero, Smr::Qsbr).unwrap();

        // Routes named after their prefix/length.
        let r10_3 = route(103);
        let r01001_5 = route(15);
        let r0100101_7 = route(17);
        let r10_2 = route(102);
        let r010010_6 = route(16);
        let r0_1 = route(1);
        let rdef = route(0);

        unsafe {
            trie.insert(pfx("10"), 3, r10_3);
            trie.insert(pfx("01001"), 5, r01001_5);
            trie.insert(pfx("0100101"), 7, r0100101_7);
            trie.insert(pfx("10"), 2, r10_2);
            trie.insert(pfx("010010"), 6, r010010_6);
            trie.insert(pfx("0"), 1, r0_1);
            trie.insert(0, 0, rdef);
        }

        qsbr::acquire();
        assert_eq!(id_of(&trie, pfx("01000111")), Some(1));
        assert_eq!(id_of(&trie, pfx("01001000")), Some(16));
        assert_eq!(id_of(&trie, pfx("01001010")), Some(17));
        assert_eq!(id_of(&trie, pfx("01001100")), Some(15));
        assert_eq!(id_of(&trie, pfx("1000")), Some(103));
        assert_eq!(id_of(&trie, pfx("1010")), Some(102));
        assert_eq!(id_of(&trie, pfx("1100")), Some(0));
        qsbr::release();

        // Remove the most specific route, substituting its shorter cover.
        unsafe { trie.remove(pfx("0100101"), 7, Some(r0100101_7), Some(r010010_6)) };
        qsbr::acquire();
        assert_eq!(id_of(&trie, pfx("01001010")), Some(16));
        qsbr::release();

        drop(trie);
        qsbr::reclaim();
        qsbr::unregister();
    }

    #[test]
    fn lookup_vec_matches_scalar() {
        let dom = QsbrDomain::new(256).unwrap();
        qsbr::register(&dom);
        let trie: Mbtrie<Route> = Mbtrie::new(&[4, 4], on_zero, Smr::Qsbr).unwrap();
        let a = route(1);
        let b = route(2);
        unsafe {
            trie.insert(pfx("0"), 1, a);
            trie.insert(pfx("11"), 2, b);
        }
        qsbr::acquire();
        let mut keys = [pfx("0000"), pfx("1100"), pfx("1000")];
        let mut results = [None; 3];
        let bm = trie.lookup_vec(&mut keys, &mut results);
        assert_eq!(bm, 0b011);
        assert_eq!(unsafe { results[0].unwrap().as_ref() }.id, 1);
        assert_eq!(unsafe { results[1].unwrap().as_ref() }.id, 2);
        assert!(results[2].is_none());
        qsbr::release();
        drop(trie);
        qsbr::reclaim();
        qsbr::unregister();
    }

    #[test]
    fn refcounts_reach_zero() {
        let dom = QsbrDomain::new(256).unwrap();
        qsbr::register(&dom);
        let before = FREED.load(Ordering::Relaxed);
        let trie: Mbtrie<Route> = Mbtrie::new(&[4, 4], on_zero, Smr::Qsbr).unwrap();
        let a = route(7);
        unsafe {
            trie.insert(pfx("0101"), 4, a);
            trie.remove(pfx("0101"), 4, Some(a), None);
        }
        // The element's last slot reference is gone.
        assert_eq!(FREED.load(Ordering::Relaxed), before + 1);
        drop(trie);
        qsbr::reclaim();
        qsbr::unregister();
        drop(unsafe { Box::from_raw(a.as_ptr()) });
    }
}
