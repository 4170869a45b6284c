/*!
Multi-word compare-and-swap (CAS-N), after Harris, Fraser & Pratt,
"A practical multi-word compare-and-swap".

Shared locations hold word-sized values whose two low bits are reserved:
they tag pointers to CCAS and MCAS descriptors while an operation is in
flight. Readers must go through [`read`]; any thread that encounters a
descriptor helps the operation along, so the construction is lock-free.

Descriptors are recycled through a per-thread stash and reclaimed through
the chosen SMR scheme ([`init`] pre-allocates a stash; descriptors are
also allocated on demand).
*/

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::errhnd;
use crate::hazptr::{self, Hazard};
use crate::qsbr;
use crate::utils::doze;

// 2 lsb of location values mark our descriptors.
const CCAS_BIT: usize = 1;
const MCAS_BIT: usize = 2;
const DESC_BITS: usize = CCAS_BIT | MCAS_BIT;

#[inline]
fn is_desc(v: usize) -> bool {
    v & DESC_BITS != 0
}

#[inline]
fn is_ccas_desc(v: usize) -> bool {
    v & CCAS_BIT != 0
}

#[inline]
fn is_mcas_desc(v: usize) -> bool {
    v & MCAS_BIT != 0
}

#[inline]
fn clr_desc(v: usize) -> *mut McasDesc {
    (v & !DESC_BITS) as *mut McasDesc
}

const UNDECIDED: u8 = 0;
const SUCCESS: u8 = 1;
const FAILURE: u8 = 2;

#[derive(Clone, Copy)]
struct CcasDesc {
    loc: *const AtomicUsize,
    exp: usize,
    new: usize,
}

struct McasDesc {
    maxn: u32,
    n: u32,
    status: AtomicU8,
    next: *mut McasDesc,
    ccas: Box<[CcasDesc]>,
}

thread_local! {
    static STASH: Cell<*mut McasDesc> = const { Cell::new(std::ptr::null_mut()) };
}

fn alloc_mcas_desc(n: u32) -> *mut McasDesc {
    let head = STASH.with(|s| s.get());
    if !head.is_null() && unsafe { &*head }.maxn >= n {
        STASH.with(|s| s.set(unsafe { &*head }.next));
        return head;
    }
    // Stash empty or its descriptor too small: allocate.
    Box::into_raw(Box::new(McasDesc {
        maxn: n,
        n: 0,
        status: AtomicU8::new(UNDECIDED),
        next: std::ptr::null_mut(),
        ccas: (0..n)
            .map(|_| CcasDesc {
                loc: std::ptr::null(),
                exp: 0,
                new: 0,
            })
            .collect(),
    }))
}

unsafe fn free_mcas_desc(ptr: *mut ()) {
    let md = ptr as *mut McasDesc;
    unsafe { (*md).next = STASH.with(|s| s.get()) };
    STASH.with(|s| s.set(md));
}

/// Pre-allocate `count` descriptors for `n`-location CAS operations into
/// the calling thread's stash.
pub fn init(count: u32, n: u32) {
    for _ in 0..count {
        let md = alloc_mcas_desc(n);
        unsafe { free_mcas_desc(md as *mut ()) };
    }
}

/// Free every descriptor in the calling thread's stash.
pub fn fini() {
    loop {
        let head = STASH.with(|s| s.get());
        if head.is_null() {
            return;
        }
        STASH.with(|s| s.set(unsafe { &*head }.next));
        drop(unsafe { Box::from_raw(head) });
    }
}

fn find_ccas_idx(md: &McasDesc, loc: *const AtomicUsize) -> usize {
    for i in 0..md.n as usize {
        if std::ptr::eq(md.ccas[i].loc, loc) {
            return i;
        }
    }
    errhnd::report("mcas", "corrupt MCAS descriptor", md as *const _ as usize);
    panic!("mcas: corrupt MCAS descriptor");
}

/// Finish a conditional CAS: promote the CCAS descriptor to the MCAS
/// descriptor while the operation is undecided, roll back otherwise.
fn ccas_help(md: &McasDesc, i: usize) {
    let cd = &md.ccas[i];
    let exp = md as *const McasDesc as usize | CCAS_BIT;
    let loc = unsafe { &*cd.loc };
    if md.status.load(Ordering::Acquire) == UNDECIDED {
        let _ = loc.compare_exchange(
            exp,
            md as *const McasDesc as usize | MCAS_BIT,
            Ordering::Release,
            Ordering::Relaxed,
        );
    } else {
        let _ = loc.compare_exchange(exp, cd.exp, Ordering::Relaxed, Ordering::Relaxed);
    }
}

/// Install a CCAS descriptor at location `i` of `md`. Returns the value
/// found when it differs from the expectation.
fn ccas(md: &McasDesc, i: usize, use_hp: bool, hp: &mut Hazard) -> usize {
    let cd = &md.ccas[i];
    let loc = unsafe { &*cd.loc };
    loop {
        let mut old = if use_hp {
            hazptr::acquire_with(hp, !DESC_BITS, |mo| loc.load(mo))
        } else {
            cd.exp
        };
        if old == cd.exp {
            match loc.compare_exchange(
                old,
                md as *const McasDesc as usize | CCAS_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    ccas_help(md, i);
                    return cd.exp;
                }
                Err(cur) => old = cur,
            }
        }
        if !is_ccas_desc(old) {
            return old;
        }
        // Found an alien CCAS descriptor: help it out of the way.
        let alien = unsafe { &*clr_desc(old) };
        ccas_help(alien, find_ccas_idx(alien, cd.loc));
    }
}

/// Read through any CCAS descriptors.
fn ccas_read(loc: &AtomicUsize, use_hp: bool, hp: &mut Hazard) -> usize {
    loop {
        let val = if use_hp {
            hazptr::acquire_with(hp, !DESC_BITS, |mo| loc.load(mo))
        } else {
            loc.load(Ordering::Acquire)
        };
        if !is_ccas_desc(val) {
            return val;
        }
        let alien = unsafe { &*clr_desc(val) };
        ccas_help(alien, find_ccas_idx(alien, loc as *const AtomicUsize));
    }
}

/// Drive an MCAS operation to completion (ours or somebody else's).
fn mcas_help(md: &McasDesc, use_hp: bool) -> bool {
    let mut status = md.status.load(Ordering::Acquire);
    if status == UNDECIDED {
        let mut hp = Hazard::null();
        // Phase 1: claim every location in (sorted) address order.
        status = 'claim: loop {
            for i in 0..md.n as usize {
                loop {
                    let val = ccas(md, i, use_hp, &mut hp);
                    let ours = md as *const McasDesc as usize | MCAS_BIT;
                    if val == md.ccas[i].exp || val == ours {
                        break;
                    }
                    if !is_mcas_desc(val) {
                        // Some other thread changed the location.
                        break 'claim FAILURE;
                    }
                    // Another MCAS operation holds it: help it finish.
                    mcas_help(unsafe { &*clr_desc(val) }, use_hp);
                }
            }
            break SUCCESS;
        };
        if let Err(actual) =
            md.status
                .compare_exchange(UNDECIDED, status, Ordering::AcqRel, Ordering::Acquire)
        {
            status = actual;
        }
        if use_hp {
            hazptr::release(&mut hp);
        }
    }
    // Phase 2: release the locations, finalising or rolling back.
    for i in 0..md.n as usize {
        let exp = md as *const McasDesc as usize | MCAS_BIT;
        let new = if status == SUCCESS {
            md.ccas[i].new
        } else {
            md.ccas[i].exp
        };
        let loc = unsafe { &*md.ccas[i].loc };
        let _ = loc.compare_exchange(exp, new, Ordering::Release, Ordering::Relaxed);
    }
    status == SUCCESS
}

/// Compare-and-swap over `locs` as one atomic operation.
///
/// All values must have their two low bits clear. The calling thread must
/// be registered with the corresponding reclamation scheme.
pub fn casn(locs: &[&AtomicUsize], exp: &[usize], new: &[usize], use_hp: bool) -> bool {
    let n = locs.len() as u32;
    assert!(exp.len() == locs.len() && new.len() == locs.len());
    let md_ptr = alloc_mcas_desc(n);
    {
        let md = unsafe { &mut *md_ptr };
        md.status.store(UNDECIDED, Ordering::Relaxed);
        md.n = n;
        let mut nn = 0usize;
        for i in 0..locs.len() {
            if is_desc(new[i]) || is_desc(exp[i]) {
                unsafe { free_mcas_desc(md_ptr as *mut ()) };
                errhnd::report("mcas", "invalid argument", new[i]);
                return false;
            }
            // Insert sorted by address so concurrent operations claim
            // locations in the same order.
            let e = CcasDesc {
                loc: locs[i] as *const AtomicUsize,
                exp: exp[i],
                new: new[i],
            };
            let mut pos = nn;
            for j in 0..nn {
                if std::ptr::eq(e.loc, md.ccas[j].loc) {
                    unsafe { free_mcas_desc(md_ptr as *mut ()) };
                    errhnd::report("mcas", "duplicate address", e.loc as usize);
                    return false;
                }
                if (e.loc as usize) < md.ccas[j].loc as usize {
                    pos = j;
                    break;
                }
            }
            for j in (pos..nn).rev() {
                md.ccas[j + 1] = md.ccas[j];
            }
            md.ccas[pos] = e;
            nn += 1;
        }
        debug_assert_eq!(nn as u32, n);
    }
    let success = mcas_help(unsafe { &*md_ptr }, use_hp);
    // The descriptor may still be referenced by helpers: retire it.
    if use_hp {
        while !unsafe { hazptr::retire(md_ptr as *mut (), free_mcas_desc) } {
            hazptr::reclaim();
        }
    } else {
        let mut tries = 0u32;
        while !unsafe { qsbr::retire(md_ptr as *mut (), free_mcas_desc) } {
            qsbr::reclaim();
            tries += 1;
            if tries > 1 {
                doze();
            }
        }
    }
    success
}

/// Read a location that participates in MCAS operations, helping any
/// in-flight operation to completion. Pass a hazard in HP mode; the
/// returned value stays protected until the hazard is released.
pub fn read(loc: &AtomicUsize, hp: Option<&mut Hazard>) -> usize {
    let use_hp = hp.is_some();
    let mut local = Hazard::null();
    let hp = match hp {
        Some(h) => h,
        None => &mut local,
    };
    loop {
        let val = ccas_read(loc, use_hp, hp);
        if !is_mcas_desc(val) {
            debug_assert!(!is_desc(val));
            return val;
        }
        // The hazard protects the descriptor while we help.
        mcas_help(unsafe { &*clr_desc(val) }, use_hp);
    }
}

/// Single-location CAS compatible with [`casn`]'s protocol.
pub fn cas1(loc: &AtomicUsize, exp: usize, new: usize, use_hp: bool) -> bool {
    if is_desc(new) {
        errhnd::report("mcas", "invalid argument", new);
        return false;
    }
    let mut hp = Hazard::null();
    loop {
        let old = read(loc, if use_hp { Some(&mut hp) } else { None });
        if old != exp {
            if use_hp {
                hazptr::release(&mut hp);
            }
            return false;
        }
        if loc
            .compare_exchange(old, new, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            if use_hp {
                hazptr::release(&mut hp);
            }
            return true;
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qsbr::QsbrDomain;

    #[test]
    fn casn_swaps_all_or_nothing() {
        let dom = QsbrDomain::new(64).unwrap();
        qsbr::register(&dom);
        let a = AtomicUsize::new(4);
        let b = AtomicUsize::new(8);

        assert!(casn(&[&a, &b], &[4, 8], &[12, 16], false));
        assert_eq!(read(&a, None), 12);
        assert_eq!(read(&b, None), 16);

        // One expectation wrong: nothing changes.
        assert!(!casn(&[&a, &b], &[12, 8], &[20, 24], false));
        assert_eq!(read(&a, None), 12);
        assert_eq!(read(&b, None), 16);

        qsbr::reclaim();
        qsbr::unregister();
        fini();
    }

    #[test]
    fn concurrent_counters_consistent() {
        let dom = QsbrDomain::new(64).unwrap();
        qsbr::register(&dom);
        init(4, 2);
        let a = AtomicUsize::new(0);
        let b = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let dom = dom.clone();
                    qsbr::register(&dom);
                    for _ in 0..500 {
                        qsbr::acquire();
                        loop {
                            let x = read(&a, None);
                            let y = read(&b, None);
                            // Both words move in lockstep, by 4 to keep
                            // the tag bits clear.
                            if x == y && casn(&[&a, &b], &[x, y], &[x + 4, y + 4], false) {
                                break;
                            }
                        }
                        qsbr::release();
                    }
                    while qsbr::reclaim() != 0 {
                        doze();
                    }
                    qsbr::unregister();
                    fini();
                });
            }
        });
        assert_eq!(read(&a, None), 4000);
        assert_eq!(read(&b, None), 4000);
        qsbr::reclaim();
        qsbr::unregister();
        fini();
    }
}
