//! Cross-module scenarios: containers driven through both reclamation
//! schemes, the error handler converting faults into sentinel returns, and
//! the documented end-to-end sequences.

use std::ptr::NonNull;

use manycore::errhnd::{self, ErrAction};
use manycore::hashtable::{HashEntry, HashLink, HashTable};
use manycore::hazptr::{self, Hazard, HpDomain};
use manycore::hopscotch::{Hopscotch, HopscotchEntry};
use manycore::msqueue::{Aba, MsQueue, MsqElem};
use manycore::qsbr::{self, QsbrDomain};
use manycore::Smr;

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

impl HopscotchEntry for Item {
    type Key = u64;
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

fn ignore_handler(_m: &str, _e: &str, _v: usize) -> ErrAction {
    ErrAction::Return
}

#[test]
fn hopscotch_scenario_s1() {
    let dom = HpDomain::new(64, 8).unwrap();
    hazptr::register(&dom);
    // 24 buckets, no cellar, hash 0 for every key.
    let ht: Hopscotch<Item> = Hopscotch::new(24, 0, Smr::HazardPointers).unwrap();
    let a = item(242);
    let b = item(243);
    assert!(unsafe { ht.insert(a, 0) });
    assert!(unsafe { ht.insert(b, 0) });

    let mut hp = Hazard::null();
    assert_eq!(ht.lookup(&242, 0, &mut hp), Some(a));
    hazptr::release(&mut hp);
    assert_eq!(ht.lookup(&244, 0, &mut hp), None);

    assert!(ht.remove(a, 0));
    assert_eq!(ht.lookup(&242, 0, &mut hp), None);
    assert!(ht.remove(b, 0));

    drop(unsafe { Box::from_raw(a.as_ptr()) });
    drop(unsafe { Box::from_raw(b.as_ptr()) });
    hazptr::unregister();
}

#[test]
fn msqueue_scenario_s3_all_strategies() {
    let dom = HpDomain::new(64, 8).unwrap();
    hazptr::register(&dom);
    for aba in [Aba::Lock, Aba::Tag, Aba::Smr] {
        let queue = unsafe { MsQueue::new(aba, MsqElem::alloc(8)) };
        let mut free: Vec<_> = (0..4).map(|_| MsqElem::alloc(8)).collect();
        let mut buf = [0u8; 8];

        unsafe { queue.enqueue(free.pop().unwrap(), &10u64.to_ne_bytes()) };
        let (n, len) = queue.dequeue(&mut buf).unwrap();
        assert_eq!((len, u64::from_ne_bytes(buf)), (8, 10));
        free.push(n);
        assert!(queue.dequeue(&mut buf).is_none());

        for v in [20u64, 30, 40] {
            unsafe { queue.enqueue(free.pop().unwrap(), &v.to_ne_bytes()) };
        }
        for v in [20u64, 30, 40] {
            let (n, _) = queue.dequeue(&mut buf).unwrap();
            assert_eq!(u64::from_ne_bytes(buf), v);
            free.push(n);
        }
        let dummy = queue.fini().unwrap();
        unsafe { MsqElem::free(dummy) };
        for n in free {
            unsafe { MsqElem::free(n) };
        }
    }
    hazptr::unregister();
}

#[test]
fn hashtable_under_qsbr_retires_removed_nodes() {
    static FREED: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

    unsafe fn free_item(p: *mut ()) {
        FREED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        drop(unsafe { Box::from_raw(p as *mut Item) });
    }

    let dom = QsbrDomain::new(64).unwrap();
    qsbr::register(&dom);
    let ht: HashTable<Item> = HashTable::new(32, Smr::Qsbr).unwrap();

    let a = item(1);
    unsafe { ht.insert(a, 1) };

    qsbr::acquire();
    let mut hp = Hazard::null();
    let found = ht.lookup(&1, 1, &mut hp).unwrap();
    assert_eq!(found, a);

    // Remove and retire while we still hold the read-side region.
    assert!(unsafe { ht.remove(a, 1) });
    assert!(unsafe { qsbr::retire(a.as_ptr() as *mut (), free_item) });
    assert_eq!(qsbr::reclaim(), 1);
    assert_eq!(FREED.load(std::sync::atomic::Ordering::Relaxed), 0);
    qsbr::release();

    // Region left: the node is reclaimable now.
    assert_eq!(qsbr::reclaim(), 0);
    assert_eq!(FREED.load(std::sync::atomic::Ordering::Relaxed), 1);
    qsbr::unregister();
}

#[test]
fn error_handler_turns_faults_into_sentinels() {
    let prev = errhnd::install(Some(ignore_handler));
    assert_eq!(prev, None);

    // Invalid construction parameters fail softly under Return.
    assert!(HpDomain::new(64, 0).is_none());
    assert!(HpDomain::new(0, 4).is_none());
    assert!(QsbrDomain::new(0).is_none());
    assert!(manycore::buckring::BuckRing::<u64>::new(0).is_none());
    assert!(
        manycore::ringbuf::RingBuf::<u64>::new(
            0,
            manycore::ringbuf::Producer::Single,
            manycore::ringbuf::Consumer::Single
        )
        .is_none()
    );
    assert!(HashTable::<Item>::new(0, Smr::Qsbr).is_none());
    assert!(Hopscotch::<Item>::new(1, 0, Smr::Qsbr).is_none());

    assert_eq!(errhnd::install(None), Some(ignore_handler as errhnd::ErrHandler));
}

#[test]
fn deactivated_threads_do_not_block_reclaim() {
    let dom = HpDomain::new(16, 2).unwrap();
    hazptr::register(&dom);

    static FREED: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    unsafe fn free_u64(p: *mut ()) {
        FREED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        drop(unsafe { Box::from_raw(p as *mut u64) });
    }

    std::thread::scope(|s| {
        let dom2 = dom.clone();
        s.spawn(move || {
            hazptr::register(&dom2);
            // This thread holds no references and deactivates.
            hazptr::deactivate();
            // Park here until the main thread is done.
            std::thread::sleep(std::time::Duration::from_millis(50));
            hazptr::activate();
            hazptr::unregister();
        });

        let obj = Box::into_raw(Box::new(5u64));
        assert!(unsafe { hazptr::retire(obj as *mut (), free_u64) });
        // The deactivated thread must not keep the object alive.
        while hazptr::reclaim() != 0 {
            std::thread::yield_now();
        }
        assert_eq!(FREED.load(std::sync::atomic::Ordering::Relaxed), 1);
    });
    hazptr::unregister();
}
