/*!
Michael–Scott queue with a dummy node and selectable ABA strategy
(re-using [`Aba`](crate::stack::Aba)).

Elements are caller-allocated nodes carrying a byte payload of up to
`max_size` bytes; enqueue copies `data.len()` bytes in, dequeue copies them
out. The node returned by dequeue is the *previous* head (the new dummy is
the node that held the payload), so a node handed back by dequeue must not
be reused until it is safe (in Smr mode: retire it first).

The queue is finalised with [`MsQueue::fini`], which returns the remaining
dummy node once the queue is empty.
*/

use std::ptr;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;

use crate::errhnd;
use crate::hazptr::{self, Hazard};
use crate::spinlock::SpinLock;
pub use crate::stack::Aba;
use crate::utils::CachePadded;

/// Tag value marking a node that is not linked into any queue.
const NOT_IN_QUEUE: u64 = u64::MAX;

/// Queue element header. Allocate with [`MsqElem::alloc`]; the payload
/// buffer follows the header.
#[repr(C)]
pub struct MsqElem {
    next: AtomicU128,
    max_size: u32,
    cur_size: u32,
}

impl MsqElem {
    /// Allocate an element able to carry up to `max_size` payload bytes.
    pub fn alloc(max_size: u32) -> ptr::NonNull<MsqElem> {
        let layout = Self::layout(max_size);
        let raw = unsafe { std::alloc::alloc_zeroed(layout) } as *mut MsqElem;
        let Some(nn) = ptr::NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        unsafe {
            (*raw).next = AtomicU128::new(pack(ptr::null_mut(), NOT_IN_QUEUE));
            (*raw).max_size = max_size;
            (*raw).cur_size = 0;
        }
        nn
    }

    /// Free an element obtained from [`MsqElem::alloc`].
    ///
    /// # Safety
    ///
    /// The element must not be linked into a queue and no thread may still
    /// reference it.
    pub unsafe fn free(elem: ptr::NonNull<MsqElem>) {
        let max_size = unsafe { elem.as_ref() }.max_size;
        unsafe { std::alloc::dealloc(elem.as_ptr() as *mut u8, Self::layout(max_size)) };
    }

    fn layout(max_size: u32) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(
            std::mem::size_of::<MsqElem>() + max_size as usize,
            std::mem::align_of::<MsqElem>(),
        )
        .expect("element layout")
    }

    fn data(&self) -> *mut u8 {
        unsafe { (self as *const MsqElem as *mut u8).add(std::mem::size_of::<MsqElem>()) }
    }
}

#[inline]
fn pack(ptr: *mut MsqElem, tag: u64) -> u128 {
    ((tag as u128) << 64) | ptr as usize as u128
}

#[inline]
fn ptr_of(word: u128) -> *mut MsqElem {
    word as u64 as *mut MsqElem
}

#[inline]
fn tag_of(word: u128) -> u64 {
    (word >> 64) as u64
}

const TAG_INC: u64 = 1;

/// Michael–Scott queue.
pub struct MsQueue {
    head: CachePadded<AtomicU128>,
    tail: CachePadded<AtomicU128>,
    aba: Aba,
    lock: SpinLock,
}

impl MsQueue {
    /// Initialise the queue with its dummy node.
    ///
    /// # Safety
    ///
    /// `dummy` must stay valid while the queue exists; ownership passes to
    /// the queue and comes back from [`MsQueue::fini`] (or a dequeue).
    pub unsafe fn new(aba: Aba, dummy: ptr::NonNull<MsqElem>) -> Self {
        unsafe { dummy.as_ref() }
            .next
            .store(pack(ptr::null_mut(), 0), Ordering::Relaxed);
        Self {
            head: CachePadded::new(AtomicU128::new(pack(dummy.as_ptr(), 0))),
            tail: CachePadded::new(AtomicU128::new(pack(dummy.as_ptr(), 0))),
            aba,
            lock: SpinLock::new(),
        }
    }

    /// Tear the queue down; returns the dummy node, or `None` (reporting
    /// an error) when the queue is not empty.
    pub fn fini(self) -> Option<ptr::NonNull<MsqElem>> {
        let head = ptr_of(self.head.load(Ordering::Relaxed));
        if !ptr_of(unsafe { &*head }.next.load(Ordering::Relaxed)).is_null() {
            errhnd::report("msqueue", "queue not empty", head as usize);
            return None;
        }
        ptr::NonNull::new(head)
    }

    /// Enqueue `elem` at the tail carrying a copy of `data`.
    ///
    /// # Safety
    ///
    /// `elem` must be exclusively owned by the caller and not linked into
    /// any queue; it must stay valid until handed back by a dequeue (plus
    /// reclamation in Smr mode).
    pub unsafe fn enqueue(&self, elem: ptr::NonNull<MsqElem>, data: &[u8]) {
        let e = unsafe { elem.as_ref() };
        if data.len() > e.max_size as usize {
            errhnd::report("msqueue", "data size too large", data.len());
            return;
        }
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), e.data(), data.len());
            (*elem.as_ptr()).cur_size = data.len() as u32;
        }
        debug_assert_eq!(tag_of(e.next.load(Ordering::Relaxed)), NOT_IN_QUEUE);
        e.next.store(pack(ptr::null_mut(), 0), Ordering::Relaxed);
        match self.aba {
            Aba::Lock => self.enqueue_lock(elem.as_ptr()),
            Aba::Tag => self.enqueue_tag(elem.as_ptr()),
            Aba::Smr => self.enqueue_smr(elem.as_ptr()),
        }
    }

    fn enqueue_lock(&self, elem: *mut MsqElem) {
        self.lock.acquire();
        let tail = ptr_of(self.tail.load(Ordering::Relaxed));
        unsafe { &*tail }.next.store(pack(elem, 0), Ordering::Relaxed);
        self.tail.store(pack(elem, 0), Ordering::Relaxed);
        self.lock.release();
    }

    fn enqueue_tag(&self, elem: *mut MsqElem) {
        let tail = loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { &*ptr_of(tail) }.next.load(Ordering::Relaxed);
            if tail != self.tail.load(Ordering::Relaxed) {
                continue;
            }
            if !ptr_of(next).is_null() {
                // Tail does not point to the last node; help advance it.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(ptr_of(next), tag_of(tail) + TAG_INC),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                continue;
            }
            // Insert the new node after the last node.
            if unsafe { &*ptr_of(tail) }
                .next
                .compare_exchange(
                    next,
                    pack(elem, tag_of(next) + TAG_INC),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break tail;
            }
        };
        // Swing the tail to the inserted node.
        let _ = self.tail.compare_exchange(
            tail,
            pack(elem, tag_of(tail) + TAG_INC),
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    fn enqueue_smr(&self, elem: *mut MsqElem) {
        let mut hp = Hazard::null();
        let tail = loop {
            let tail = hazptr::acquire_with(&mut hp, !0, |mo| {
                ptr_of(self.tail.load(mo)) as usize
            }) as *mut MsqElem;
            let next = ptr_of(unsafe { &*tail }.next.load(Ordering::Acquire));
            if tail != ptr_of(self.tail.load(Ordering::Relaxed)) {
                continue;
            }
            if !next.is_null() {
                // Tail has fallen behind, help advance it.
                let _ = self.tail.compare_exchange(
                    pack(tail, 0),
                    pack(next, 0),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                continue;
            }
            if unsafe { &*tail }
                .next
                .compare_exchange(
                    pack(ptr::null_mut(), 0),
                    pack(elem, 0),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break tail;
            }
        };
        let _ = self.tail.compare_exchange(
            pack(tail, 0),
            pack(elem, 0),
            Ordering::Release,
            Ordering::Relaxed,
        );
        hazptr::release(&mut hp);
    }

    /// Dequeue from the head, copying the payload into `buf`. Returns the
    /// detached node and the payload length, or `None` when empty.
    ///
    /// In Smr mode the returned node must be retired before reuse.
    pub fn dequeue(&self, buf: &mut [u8]) -> Option<(ptr::NonNull<MsqElem>, usize)> {
        match self.aba {
            Aba::Lock => self.dequeue_lock(buf),
            Aba::Tag => self.dequeue_tag(buf),
            Aba::Smr => self.dequeue_smr(buf),
        }
    }

    fn copy_out(buf: &mut [u8], node: *mut MsqElem) -> Option<usize> {
        let size = unsafe { &*node }.cur_size as usize;
        if size > buf.len() {
            errhnd::report("msqueue", "data size too large", size);
            return None;
        }
        unsafe { ptr::copy_nonoverlapping((*node).data(), buf.as_mut_ptr(), size) };
        Some(size)
    }

    fn dequeue_lock(&self, buf: &mut [u8]) -> Option<(ptr::NonNull<MsqElem>, usize)> {
        self.lock.acquire();
        let head = ptr_of(self.head.load(Ordering::Relaxed));
        let next = ptr_of(unsafe { &*head }.next.load(Ordering::Relaxed));
        let result = if !next.is_null() {
            match Self::copy_out(buf, next) {
                Some(size) => {
                    self.head.store(pack(next, 0), Ordering::Relaxed);
                    Some((head, size))
                }
                None => None,
            }
        } else {
            // Only the dummy node present.
            None
        };
        self.lock.release();
        result.map(|(node, size)| {
            unsafe { &*node }
                .next
                .store(pack(ptr::null_mut(), NOT_IN_QUEUE), Ordering::Relaxed);
            (unsafe { ptr::NonNull::new_unchecked(node) }, size)
        })
    }

    fn dequeue_tag(&self, buf: &mut [u8]) -> Option<(ptr::NonNull<MsqElem>, usize)> {
        let (head, size) = loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Relaxed);
            let next = ptr_of(unsafe { &*ptr_of(head) }.next.load(Ordering::Acquire));
            if head != self.head.load(Ordering::Relaxed) {
                continue;
            }
            if ptr_of(head) == ptr_of(tail) {
                if next.is_null() {
                    return None;
                }
                // Tail has fallen behind, attempt to advance it.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(next, tag_of(tail) + TAG_INC),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                continue;
            }
            // Read the data before the CAS or we race with other dequeues.
            let size = Self::copy_out(buf, next)?;
            if self
                .head
                .compare_exchange(
                    head,
                    pack(next, tag_of(head) + TAG_INC),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break (ptr_of(head), size);
            }
        };
        unsafe { &*head }
            .next
            .store(pack(ptr::null_mut(), NOT_IN_QUEUE), Ordering::Relaxed);
        Some((unsafe { ptr::NonNull::new_unchecked(head) }, size))
    }

    fn dequeue_smr(&self, buf: &mut [u8]) -> Option<(ptr::NonNull<MsqElem>, usize)> {
        let mut hp0 = Hazard::null();
        let mut hp1 = Hazard::null();
        let (head, size) = loop {
            let head = hazptr::acquire_with(&mut hp0, !0, |mo| {
                ptr_of(self.head.load(mo)) as usize
            }) as *mut MsqElem;
            let tail = ptr_of(self.tail.load(Ordering::Relaxed));
            let next = hazptr::acquire_with(&mut hp1, !0, |mo| {
                ptr_of(unsafe { &*head }.next.load(mo)) as usize
            }) as *mut MsqElem;
            if head != ptr_of(self.head.load(Ordering::Relaxed)) {
                continue;
            }
            if next.is_null() {
                hazptr::release(&mut hp0);
                hazptr::release(&mut hp1);
                return None;
            }
            if head == tail {
                // Queue looks empty but head.next is a valid node.
                let _ = self.tail.compare_exchange(
                    pack(tail, 0),
                    pack(next, 0),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                continue;
            }
            // `next` stays valid under the hazard even after the CAS.
            if self
                .head
                .compare_exchange(
                    pack(head, 0),
                    pack(next, 0),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // The old head is ours now.
                let size = Self::copy_out(buf, next).unwrap_or(0);
                break (head, size);
            }
        };
        unsafe { &*head }
            .next
            .store(pack(ptr::null_mut(), NOT_IN_QUEUE), Ordering::Relaxed);
        hazptr::release(&mut hp0);
        hazptr::release(&mut hp1);
        Some((unsafe { ptr::NonNull::new_unchecked(head) }, size))
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazptr::HpDomain;

    fn roundtrip(aba: Aba) {
        let dummy = MsqElem::alloc(8);
        let queue = unsafe { MsQueue::new(aba, dummy) };
        let mut nodes: Vec<ptr::NonNull<MsqElem>> = (0..4).map(|_| MsqElem::alloc(8)).collect();
        let mut buf = [0u8; 8];

        // enqueue {10}, dequeue -> {10}, dequeue -> empty
        unsafe { queue.enqueue(nodes.pop().unwrap(), &10u64.to_ne_bytes()) };
        let (n, size) = queue.dequeue(&mut buf).unwrap();
        assert_eq!(size, 8);
        assert_eq!(u64::from_ne_bytes(buf), 10);
        nodes.push(n);
        assert!(queue.dequeue(&mut buf).is_none());

        // enqueue {20,30,40} in order, dequeue three times in order
        for v in [20u64, 30, 40] {
            unsafe { queue.enqueue(nodes.pop().unwrap(), &v.to_ne_bytes()) };
        }
        for v in [20u64, 30, 40] {
            let (n, size) = queue.dequeue(&mut buf).unwrap();
            assert_eq!(size, 8);
            assert_eq!(u64::from_ne_bytes(buf), v);
            nodes.push(n);
        }
        assert!(queue.dequeue(&mut buf).is_none());

        // fini returns the remaining dummy
        let dummy = queue.fini().unwrap();
        unsafe { MsqElem::free(dummy) };
        for n in nodes {
            unsafe { MsqElem::free(n) };
        }
    }

    #[test]
    fn lock_strategy() {
        roundtrip(Aba::Lock);
    }

    #[test]
    fn tag_strategy() {
        roundtrip(Aba::Tag);
    }

    #[test]
    fn smr_strategy() {
        let dom = HpDomain::new(64, 4).unwrap();
        hazptr::register(&dom);
        roundtrip(Aba::Smr);
        hazptr::unregister();
    }
}
