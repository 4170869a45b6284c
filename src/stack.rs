/*!
Lock-free (Treiber) stack of intrusive elements with a selectable ABA
strategy:

- [`Aba::Lock`]: a spinlock serialises push and pop.
- [`Aba::Tag`]: the head carries a monotonic tag, updated with the head
  pointer in one 128-bit CAS.
- [`Aba::Smr`]: pop protects the head with a hazard pointer. Push stashes
  the stack address in the element's `next` field and *retires* the
  element; the reclamation callback performs the actual push once no thread
  references the element. LIFO order is lost in this variant, which is the
  acknowledged trade-off.

Elements are caller-owned nodes embedding a [`StackElem`] link; the stack
never copies payload.
*/

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use portable_atomic::AtomicU128;

use crate::hazptr::{self, Hazard};
use crate::spinlock::SpinLock;
use crate::utils::doze;

/// Intrusive link; embed as the first field of the element type.
#[repr(C)]
pub struct StackElem {
    next: AtomicPtr<StackElem>,
}

impl StackElem {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Default for StackElem {
    fn default() -> Self {
        Self::new()
    }
}

/// ABA strategy, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aba {
    /// Serialise on an embedded spinlock.
    Lock,
    /// 128-bit `(head, tag)` CAS with a monotonic tag.
    Tag,
    /// Hazard pointers; push is deferred through `retire` and LIFO order
    /// is not guaranteed. Requires [`hazptr`] registration.
    Smr,
}

#[inline]
fn head_of(word: u128) -> *mut StackElem {
    word as u64 as *mut StackElem
}

#[inline]
fn tag_of(word: u128) -> u64 {
    (word >> 64) as u64
}

#[inline]
fn pack(head: *mut StackElem, tag: u64) -> u128 {
    ((tag as u128) << 64) | head as usize as u128
}

/// Treiber stack.
pub struct LfStack {
    word: AtomicU128,
    aba: Aba,
    lock: SpinLock,
}

impl LfStack {
    #[cfg(not(loom))]
    pub const fn new(aba: Aba) -> Self {
        Self {
            word: AtomicU128::new(0),
            aba,
            lock: SpinLock::new(),
        }
    }

    #[cfg(loom)]
    pub fn new(aba: Aba) -> Self {
        Self {
            word: AtomicU128::new(0),
            aba,
            lock: SpinLock::new(),
        }
    }

    /// Push an element.
    ///
    /// # Safety
    ///
    /// `elem` must stay valid while linked (for [`Aba::Smr`]: until popped
    /// *and* reclaimed), and must not currently be linked into any stack.
    /// In [`Aba::Smr`] mode the stack itself must outlive all pending
    /// retires.
    pub unsafe fn push(&self, elem: *mut StackElem) {
        let link = unsafe { &*elem };
        match self.aba {
            Aba::Lock => {
                self.lock.acquire();
                let old = head_of(self.word.load(Ordering::Relaxed));
                link.next.store(old, Ordering::Relaxed);
                self.word.store(pack(elem, 0), Ordering::Relaxed);
                self.lock.release();
            }
            Aba::Tag => {
                let mut old = self.word.load(Ordering::Relaxed);
                loop {
                    link.next.store(head_of(old), Ordering::Relaxed);
                    let new = pack(elem, tag_of(old).wrapping_add(1));
                    match self.word.compare_exchange_weak(
                        old,
                        new,
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(actual) => old = actual,
                    }
                }
            }
            Aba::Smr => {
                // Save the stack address in the element; the reclamation
                // callback recovers it and performs the deferred push.
                link.next
                    .store(self as *const LfStack as *mut StackElem, Ordering::Relaxed);
                while !unsafe { hazptr::retire(elem as *mut (), Self::push_cb) } {
                    // Retire buffer full; wait for space.
                    doze();
                }
                // Attempt immediate reclamation.
                hazptr::reclaim();
            }
        }
    }

    /// Reclamation callback: no thread references `elem` any more, link it
    /// in for real.
    unsafe fn push_cb(elem: *mut ()) {
        let elem = elem as *mut StackElem;
        let link = unsafe { &*elem };
        let stack = unsafe { &*(link.next.load(Ordering::Relaxed) as *const LfStack) };
        let mut old = stack.word.load(Ordering::Relaxed);
        loop {
            link.next.store(head_of(old), Ordering::Relaxed);
            match stack.word.compare_exchange_weak(
                old,
                pack(elem, tag_of(old)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }

    /// Pop the most recently pushed element (modulo the Smr caveat), or
    /// null when empty.
    pub fn pop(&self) -> *mut StackElem {
        match self.aba {
            Aba::Lock => {
                self.lock.acquire();
                let head = head_of(self.word.load(Ordering::Relaxed));
                if !head.is_null() {
                    let next = unsafe { &*head }.next.load(Ordering::Relaxed);
                    self.word.store(pack(next, 0), Ordering::Relaxed);
                }
                self.lock.release();
                head
            }
            Aba::Tag => {
                let mut old = self.word.load(Ordering::Acquire);
                loop {
                    let head = head_of(old);
                    if head.is_null() {
                        return ptr::null_mut();
                    }
                    // Dereferencing a head that may no longer be ours; the
                    // memory exists but the value may be bogus, the tag
                    // CAS rejects it then.
                    let next = unsafe { &*head }.next.load(Ordering::Relaxed);
                    match self.word.compare_exchange_weak(
                        old,
                        pack(next, tag_of(old).wrapping_add(1)),
                        Ordering::Relaxed,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return head,
                        Err(actual) => old = actual,
                    }
                }
            }
            Aba::Smr => {
                let mut hp = Hazard::null();
                let head = loop {
                    let mut old = hazptr::acquire_with(&mut hp, !0, |mo| {
                        head_of(self.word.load(mo)) as usize
                    }) as *mut StackElem;
                    if old.is_null() {
                        // Elements may be stuck in retire queues waiting
                        // for reclamation to finish.
                        hazptr::reclaim();
                        old = hazptr::acquire_with(&mut hp, !0, |mo| {
                            head_of(self.word.load(mo)) as usize
                        }) as *mut StackElem;
                        if old.is_null() {
                            break old;
                        }
                    }
                    // `old` is valid under the hazard; if another thread
                    // popped it and re-pushed, the push is still deferred
                    // in a retire list and the CAS below fails.
                    let next = unsafe { &*old }.next.load(Ordering::Relaxed);
                    let cur = self.word.load(Ordering::Relaxed);
                    if head_of(cur) == old
                        && self
                            .word
                            .compare_exchange_weak(
                                pack(old, tag_of(cur)),
                                pack(next, tag_of(cur)),
                                Ordering::Relaxed,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                    {
                        break old;
                    }
                };
                hazptr::release(&mut hp);
                head
            }
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazptr::HpDomain;

    #[repr(C)]
    struct Node {
        elem: StackElem,
        val: u32,
    }

    fn node(val: u32) -> Box<Node> {
        Box::new(Node {
            elem: StackElem::new(),
            val,
        })
    }

    fn val_of(p: *mut StackElem) -> u32 {
        unsafe { (*(p as *mut Node)).val }
    }

    fn lifo_roundtrip(aba: Aba) {
        let stack = LfStack::new(aba);
        let a = Box::into_raw(node(1));
        let b = Box::into_raw(node(2));
        unsafe {
            stack.push(&mut (*a).elem);
            stack.push(&mut (*b).elem);
        }
        assert_eq!(val_of(stack.pop()), 2);
        assert_eq!(val_of(stack.pop()), 1);
        assert!(stack.pop().is_null());
        drop(unsafe { Box::from_raw(a) });
        drop(unsafe { Box::from_raw(b) });
    }

    #[test]
    fn lock_mode() {
        lifo_roundtrip(Aba::Lock);
    }

    #[test]
    fn tag_mode() {
        lifo_roundtrip(Aba::Tag);
    }

    #[test]
    fn smr_mode() {
        let dom = HpDomain::new(64, 4).unwrap();
        hazptr::register(&dom);
        let stack = LfStack::new(Aba::Smr);
        let a = Box::into_raw(node(1));
        let b = Box::into_raw(node(2));
        unsafe {
            stack.push(&mut (*a).elem);
            stack.push(&mut (*b).elem);
        }
        // Deferred pushes complete during reclamation; with no hazards
        // held both elements must be linked by now.
        let mut seen = Vec::new();
        loop {
            let p = stack.pop();
            if p.is_null() {
                break;
            }
            seen.push(val_of(p));
        }
        seen.sort_unstable();
        assert_eq!(seen, [1, 2]);
        drop(unsafe { Box::from_raw(a) });
        drop(unsafe { Box::from_raw(b) });
        hazptr::unregister();
    }
}
