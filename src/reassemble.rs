/*!
Lock-free IP reassembly using a bespoke fragment table.

Fragments accumulate in per-slot fraglists; a fraglist is one 128-bit word
holding the list head plus packed metadata: earliest arrival time,
accumulated size and expected total size (in 8-byte octwords), and a 3-bit
ABA counter. Inserting merges the new fragment with the current list in a
single CAS; when the accumulated size reaches the total,
the inserter takes the whole list, sorts it and hands complete datagrams to
the completion callback. [`Reassemble::expire`] sweeps lists whose earliest
arrival is older than the given time and passes stale fragments to the
stale callback.

Time comparisons use serial-number arithmetic on 32-bit arrival times.
*/

use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;

use crate::errhnd;

// totsize = 65535 bytes => 8192 octwords => 14 bits needed.
const OCT_SIZEMAX: u32 = (1 << 14) - 1;

// IPv4 fragment info.
const IP_FRAG_MORE: u16 = 0x2000;
const IP_FRAG_MASK: u16 = 0x1fff;

#[inline]
fn fi2off(fi: u16) -> u32 {
    (fi & IP_FRAG_MASK) as u32 * 8
}

#[inline]
fn fi2more(fi: u16) -> bool {
    fi & IP_FRAG_MORE != 0
}

#[inline]
fn len2oct(len: u16) -> u32 {
    (len as u32 + 7) / 8
}

/// A single IP fragment, caller-owned.
#[repr(C)]
pub struct Fragment {
    /// Link used while the fragment sits in the table or a callback list.
    pub nextfrag: *mut Fragment,
    /// Hash of <src, dst, proto, id>.
    pub hash: u64,
    /// Arrival time (serial number arithmetic).
    pub arrival: u32,
    /// Fragment info from the IPv4 header (host endian).
    pub fraginfo: u16,
    /// Length in bytes of the IPv4 payload.
    pub len: u16,
}

fn totsize_oct(f: &Fragment) -> u32 {
    if fi2more(f.fraginfo) {
        // Not the last fragment: total size still unknown.
        OCT_SIZEMAX
    } else {
        (fi2off(f.fraginfo) + f.len as u32 + 7) / 8
    }
}

// Fraglist metadata packed in the low 64 bits:
// earliest:32 | accsize:14 | totsize:14 | aba:3 (top bit unused)
#[derive(Clone, Copy, PartialEq, Eq)]
struct FragList {
    earliest: u32,
    accsize: u32,
    totsize: u32,
    aba: u32,
    head: *mut Fragment,
}

const FL_NULL: FragList = FragList {
    earliest: 0,
    accsize: 0,
    totsize: OCT_SIZEMAX,
    aba: 0,
    head: ptr::null_mut(),
};

fn fl_pack(fl: FragList) -> u128 {
    let meta = fl.earliest as u64
        | ((fl.accsize as u64 & 0x3fff) << 32)
        | ((fl.totsize as u64 & 0x3fff) << 46)
        | ((fl.aba as u64 & 0x7) << 60);
    ((fl.head as usize as u64 as u128) << 64) | meta as u128
}

fn fl_unpack(word: u128) -> FragList {
    let meta = word as u64;
    FragList {
        earliest: meta as u32,
        accsize: ((meta >> 32) & 0x3fff) as u32,
        totsize: ((meta >> 46) & 0x3fff) as u32,
        aba: ((meta >> 60) & 0x7) as u32,
        head: (word >> 64) as u64 as usize as *mut Fragment,
    }
}

#[inline]
fn umin(a: u32, b: u32) -> u32 {
    a.min(b)
}

/// Earlier of two times relative to `now` in serial arithmetic.
#[inline]
fn min_earliest(a: u32, b: u32, now: u32) -> u32 {
    let da = a.wrapping_sub(now) as i32;
    let db = b.wrapping_sub(now) as i32;
    now.wrapping_add(da.min(db) as u32)
}

#[inline]
fn time_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Callback receiving a fragment list (complete datagram or stale chain).
pub type ReassembleCb = Box<dyn Fn(NonNull<Fragment>) + Send + Sync>;

/// Lock-free reassembly table.
pub struct Reassemble {
    mask: usize,
    table: Box<[AtomicU128]>,
    complete_cb: ReassembleCb,
    stale_cb: ReassembleCb,
}

unsafe impl Send for Reassemble {}
unsafe impl Sync for Reassemble {}

/// Add fragments one by one building a list sorted by (hash, offset).
unsafe fn sort_frags(mut frag: *mut Fragment) -> *mut Fragment {
    let mut head: *mut Fragment = ptr::null_mut();
    unsafe {
        while !frag.is_null() {
            let nextfrag = (*frag).nextfrag;
            let mut prev: *mut *mut Fragment = &mut head;
            let mut seg = head;
            while !seg.is_null()
                && ((*seg).hash < (*frag).hash
                    || ((*seg).hash == (*frag).hash
                        && fi2off((*seg).fraginfo) < fi2off((*frag).fraginfo)))
            {
                prev = &mut (*seg).nextfrag;
                seg = (*seg).nextfrag;
            }
            *prev = frag;
            (*frag).nextfrag = seg;
            frag = nextfrag;
        }
    }
    head
}

/// Snip and return the first complete datagram, or null.
unsafe fn is_complete(mut prev: *mut *mut Fragment) -> *mut Fragment {
    unsafe {
        'restart: loop {
            let mut frag = *prev;
            let mut expected_off = 0u32;
            while !frag.is_null() {
                if fi2off((*frag).fraginfo) != expected_off {
                    // Missing leading fragment.
                    return ptr::null_mut();
                }
                let next = (*frag).nextfrag;
                if next.is_null() || (*next).hash != (*frag).hash {
                    if fi2more((*frag).fraginfo) {
                        // The true last fragment is missing.
                        break;
                    }
                    // Complete datagram: snip its fragment list off.
                    let head = *prev;
                    *prev = next;
                    (*frag).nextfrag = ptr::null_mut();
                    return head;
                }
                if !fi2more((*frag).fraginfo) {
                    // Premature end (duplicated last fragment?).
                    break;
                }
                if fi2off((*next).fraginfo) > fi2off((*frag).fraginfo) + (*frag).len as u32 {
                    // Hole between frag and its successor.
                    break;
                }
                // Overlap is the caller's problem.
                expected_off += (*frag).len as u32;
                frag = (*frag).nextfrag;
            }
            if !frag.is_null() {
                // Discontinuity: skip to the next datagram (hash group).
                let hash = (*frag).hash;
                while !(*frag).nextfrag.is_null() && (*(*frag).nextfrag).hash == hash {
                    frag = (*frag).nextfrag;
                }
                prev = &mut (*frag).nextfrag;
                continue 'restart;
            }
            return ptr::null_mut();
        }
    }
}

/// Walk a list computing its sizes and earliest arrival; returns the link
/// slot of the last fragment.
unsafe fn recompute(
    head: *mut *mut Fragment,
    now: u32,
) -> (*mut *mut Fragment, u32, u32, u32) {
    let mut fragsize = 0u32;
    let mut totsize = OCT_SIZEMAX;
    let mut earliest = now;
    let mut last = head;
    unsafe {
        while !(*last).is_null() {
            let f = &**last;
            fragsize = umin(OCT_SIZEMAX, fragsize + len2oct(f.len));
            totsize = umin(totsize, totsize_oct(f));
            earliest = min_earliest(earliest, f.arrival, now);
            last = &mut (**last).nextfrag;
        }
    }
    (last, fragsize, totsize, earliest)
}

impl Reassemble {
    /// Allocate a fragment table of `size` slots (a power of two).
    pub fn new(size: u32, complete_cb: ReassembleCb, stale_cb: ReassembleCb) -> Option<Self> {
        if size < 1 || !size.is_power_of_two() {
            errhnd::report("reassemble", "invalid fragment table size", size as usize);
            return None;
        }
        Some(Self {
            mask: size as usize - 1,
            table: (0..size).map(|_| AtomicU128::new(fl_pack(FL_NULL))).collect(),
            complete_cb,
            stale_cb,
        })
    }

    fn reassemble(&self, head: *mut *mut Fragment) -> u32 {
        let mut numdg = 0;
        unsafe {
            while !(*head).is_null() {
                let dg = is_complete(head);
                let Some(dg) = NonNull::new(dg) else {
                    break;
                };
                (self.complete_cb)(dg);
                numdg += 1;
            }
        }
        numdg
    }

    /// Insert a single fragment, reassembling when it completes one or
    /// more datagrams.
    ///
    /// # Safety
    ///
    /// `frag` must be exclusively owned, fully initialised, and stay valid
    /// until handed back through one of the callbacks.
    pub unsafe fn insert(&self, frag: NonNull<Fragment>) {
        let now = unsafe { frag.as_ref() }.arrival;
        unsafe { (*frag.as_ptr()).nextfrag = ptr::null_mut() };
        let fl = &self.table[(unsafe { frag.as_ref() }.hash as usize) & self.mask];
        let mut head = frag.as_ptr();
        let mut false_positive = false;
        let (mut last, mut fragsize, mut totsize, mut earliest) =
            unsafe { recompute(&mut head, now) };
        loop {
            let old_word = fl.load(Ordering::Relaxed);
            let old = fl_unpack(old_word);
            if !old.head.is_null() {
                false_positive = false;
            }
            // Merge: the previous list hangs off the end of ours.
            unsafe { *last = old.head };
            let accsize = umin(OCT_SIZEMAX, old.accsize + fragsize);
            let new_totsize = umin(old.totsize, totsize);
            if accsize < new_totsize || false_positive {
                // Still missing fragments: write back the merged list.
                let new = FragList {
                    earliest: if !old.head.is_null() {
                        min_earliest(old.earliest, earliest, now)
                    } else {
                        earliest
                    },
                    accsize,
                    totsize: new_totsize,
                    aba: old.aba.wrapping_add(1),
                    head,
                };
                if fl
                    .compare_exchange(
                        old_word,
                        fl_pack(new),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            // We seem to have every fragment: take the whole list.
            if fl
                .compare_exchange(
                    old_word,
                    fl_pack(FL_NULL),
                    // Acquire pairs with the releases that linked old.head.
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }
            head = unsafe { sort_frags(head) };
            false_positive = self.reassemble(&mut head) == 0;
            if head.is_null() {
                return;
            }
            // Leftover fragments (some other datagram): reinsert them.
            let r = unsafe { recompute(&mut head, now) };
            last = r.0;
            fragsize = r.1;
            totsize = r.2;
            earliest = r.3;
        }
    }

    /// Expire fragments that arrived before `time`: their lists go to the
    /// stale callback. Reassembly may occur for fresh leftovers.
    pub fn expire(&self, time: u32) {
        for fl in self.table.iter() {
            let old_word = fl.load(Ordering::Relaxed);
            let old = fl_unpack(old_word);
            if old.head.is_null() || !time_before(old.earliest, time) {
                continue;
            }
            // Take the whole list.
            if fl
                .compare_exchange(old_word, fl_pack(FL_NULL), Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Somebody got there first; they own the list now.
                continue;
            }
            // Partition into stale and fresh fragments.
            let mut stale: *mut Fragment = ptr::null_mut();
            let mut fresh: *mut Fragment = ptr::null_mut();
            let mut frag = old.head;
            unsafe {
                while !frag.is_null() {
                    let next = (*frag).nextfrag;
                    if time_before((*frag).arrival, time) {
                        (*frag).nextfrag = stale;
                        stale = frag;
                    } else {
                        (*frag).nextfrag = fresh;
                        fresh = frag;
                    }
                    frag = next;
                }
                if let Some(nn) = NonNull::new(stale) {
                    (self.stale_cb)(nn);
                }
                // Fresh fragments go back in; they may now complete.
                while !fresh.is_null() {
                    let next = (*fresh).nextfrag;
                    self.insert(NonNull::new_unchecked(fresh));
                    fresh = next;
                }
            }
        }
    }
}

impl Drop for Reassemble {
    fn drop(&mut self) {
        // Remaining fragments count as stale.
        for fl in self.table.iter() {
            let old = fl_unpack(fl.load(Ordering::Relaxed));
            if let Some(nn) = NonNull::new(old.head) {
                (self.stale_cb)(nn);
            }
        }
    }
}

// -------------------------------------
