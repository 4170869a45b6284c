/*!
Shared contract between the reclamation schemes and the containers.

Every container that links and unlinks nodes is constructed with an [`Smr`]
selector. In hazard-pointer mode, lookups leave the hazard slot set on the
returned node and the caller releases it; in QSBR mode the container brackets
its own accesses in a read-side region and callers bracket theirs around any
returned reference.
*/

use crate::hazptr::{self, Hazard};
use crate::qsbr;

/// Reclamation scheme a container runs under. The calling thread must be
/// registered with a domain of the matching kind for every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Smr {
    /// Hazard pointers: lookups pin the returned node via a [`Hazard`].
    HazardPointers,
    /// Quiescent-state based reclamation: callers bracket accesses with
    /// [`qsbr::acquire`]/[`qsbr::release`].
    Qsbr,
}

impl Smr {
    #[inline]
    pub(crate) fn use_hp(self) -> bool {
        self == Smr::HazardPointers
    }
}

/// Release a hazard taken through an HP-mode load; no-op in QSBR mode.
#[inline]
pub(crate) fn ptr_release(use_hp: bool, hp: &mut Hazard) {
    if use_hp {
        hazptr::release(hp);
    }
}

/// Enter/leave the container-internal read-side region in QSBR mode.
#[inline]
pub(crate) fn enter(use_hp: bool) {
    if !use_hp {
        qsbr::acquire();
    }
}

#[inline]
pub(crate) fn leave(use_hp: bool) {
    if !use_hp {
        qsbr::release();
    }
}

/// Retire through whichever scheme the container uses.
///
/// # Safety
///
/// Same contract as [`hazptr::retire`]/[`qsbr::retire`].
#[inline]
pub(crate) unsafe fn retire(use_hp: bool, ptr: *mut (), cb: unsafe fn(*mut ())) -> bool {
    if use_hp {
        unsafe { hazptr::retire(ptr, cb) }
    } else {
        unsafe { qsbr::retire(ptr, cb) }
    }
}

/// Retire, spinning on a full retire list until space frees up.
pub(crate) unsafe fn retire_spin(use_hp: bool, ptr: *mut (), cb: unsafe fn(*mut ())) {
    while !unsafe { retire(use_hp, ptr, cb) } {
        crate::utils::doze();
    }
}
