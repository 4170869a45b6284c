//! Multi-threaded stress tests: the hazard-pointer swap scenario (readers
//! must never observe a reclaimed object), queue fan-in/fan-out, and lock
//! fairness under contention.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use rand::Rng;

use manycore::hazptr::{self, Hazard, HpDomain};
use manycore::msqueue::{Aba, MsQueue, MsqElem};
use manycore::tktlock::TktLock;

const SENTINEL: u64 = 0xdead_dead_dead_dead;

struct Obj {
    value: AtomicU64,
}

unsafe fn reclaim_obj(p: *mut ()) {
    let obj = p as *mut Obj;
    // Poison before the memory is reused so a racing reader would see it.
    unsafe { (*obj).value.store(SENTINEL, Ordering::Relaxed) };
    drop(unsafe { Box::from_raw(obj) });
}

/// One writer swaps objects in and out of a table of slots while readers
/// acquire, read and release. No reader may ever see the reclaim-time
/// sentinel.
#[test]
fn hazard_pointers_protect_readers() {
    const SLOTS: usize = 100;
    const WRITES: usize = 20_000;
    const READERS: usize = 3;

    let dom = HpDomain::new(512, 4).unwrap();
    let slots: Vec<AtomicPtr<Obj>> = (0..SLOTS)
        .map(|i| {
            AtomicPtr::new(Box::into_raw(Box::new(Obj {
                value: AtomicU64::new(i as u64),
            })))
        })
        .collect();
    let stop = AtomicBool::new(false);

    std::thread::scope(|s| {
        for _ in 0..READERS {
            let dom = dom.clone();
            let slots = &slots;
            let stop = &stop;
            s.spawn(move || {
                hazptr::register(&dom);
                let mut rng = rand::thread_rng();
                let mut hp = Hazard::null();
                while !stop.load(Ordering::Acquire) {
                    let i = rng.gen_range(0..SLOTS);
                    let p = hazptr::acquire(&slots[i], &mut hp);
                    if !p.is_null() {
                        let v = unsafe { &*p }.value.load(Ordering::Relaxed);
                        assert_ne!(v, SENTINEL, "read from a reclaimed object");
                    }
                    hazptr::release(&mut hp);
                }
                hazptr::unregister();
            });
        }

        {
            let dom = dom.clone();
            let slots = &slots;
            let stop = &stop;
            s.spawn(move || {
                hazptr::register(&dom);
                let mut rng = rand::thread_rng();
                for n in 0..WRITES {
                    let i = rng.gen_range(0..SLOTS);
                    let fresh = Box::into_raw(Box::new(Obj {
                        value: AtomicU64::new(n as u64),
                    }));
                    let old = slots[i].swap(fresh, Ordering::AcqRel);
                    while !unsafe { hazptr::retire(old as *mut (), reclaim_obj) } {
                        hazptr::reclaim();
                    }
                }
                while hazptr::reclaim() != 0 {
                    std::thread::yield_now();
                }
                stop.store(true, Ordering::Release);
                hazptr::unregister();
            });
        }
    });

    for slot in &slots {
        let p = slot.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(p) });
    }
}

/// MPMC fan-in/fan-out through the MS queue with the Tag strategy: no
/// element is lost or duplicated.
#[test]
fn msqueue_mpmc_tag() {
    const PRODUCERS: u64 = 2;
    const PER_PRODUCER: u64 = 2_000;

    let queue = unsafe { MsQueue::new(Aba::Tag, MsqElem::alloc(8)) };
    let sum = AtomicU64::new(0);
    let consumed = AtomicU64::new(0);
    // Tag mode tolerates stale reads of dequeued nodes but not unmapped
    // memory: keep every node alive until all threads are done.
    let drained: std::sync::Mutex<Vec<usize>> = std::sync::Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for t in 0..PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let v = t * PER_PRODUCER * 10 + i + 1;
                    let node = MsqElem::alloc(8);
                    unsafe { queue.enqueue(node, &v.to_ne_bytes()) };
                }
            });
        }
        for _ in 0..2 {
            s.spawn(|| {
                let mut local = Vec::new();
                let mut buf = [0u8; 8];
                while consumed.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                    match queue.dequeue(&mut buf) {
                        Some((node, len)) => {
                            assert_eq!(len, 8);
                            sum.fetch_add(u64::from_ne_bytes(buf), Ordering::Relaxed);
                            consumed.fetch_add(1, Ordering::Relaxed);
                            local.push(node.as_ptr() as usize);
                        }
                        None => std::thread::yield_now(),
                    }
                }
                drained.lock().unwrap().extend(local);
            });
        }
    });

    for node in drained.into_inner().unwrap() {
        unsafe { MsqElem::free(ptr::NonNull::new_unchecked(node as *mut MsqElem)) };
    }

    let expect: u64 = (0..PRODUCERS)
        .map(|t| (1..=PER_PRODUCER).map(|i| t * PER_PRODUCER * 10 + i).sum::<u64>())
        .sum();
    assert_eq!(sum.load(Ordering::Relaxed), expect);

    let dummy = queue.fini().unwrap();
    unsafe { MsqElem::free(dummy) };
}

/// Ticket lock under contention: no lost updates through the unlocked
/// read-modify-write in the critical section.
#[test]
fn ticket_lock_counting() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 1_000;

    let lock = TktLock::new();
    let shared = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    lock.acquire();
                    let v = shared.load(Ordering::Relaxed);
                    std::hint::spin_loop();
                    shared.store(v + 1, Ordering::Relaxed);
                    lock.release();
                }
            });
        }
    });
    assert_eq!(shared.load(Ordering::Relaxed), THREADS * ROUNDS);
}

/// Concurrent inserts and removes on the chained hash table leave exactly
/// the expected residue.
#[test]
fn hashtable_concurrent_churn() {
    use manycore::hashtable::{HashEntry, HashLink, HashTable};
    use manycore::Smr;

    struct Node {
        link: HashLink,
        key: u64,
    }

    unsafe impl HashEntry for Node {
        type Key = u64;
        fn link(&self) -> &HashLink {
            &self.link
        }
        fn key_matches(&self, key: &u64) -> bool {
            self.key == *key
        }
    }

    const PER_THREAD: u64 = 500;
    let dom = HpDomain::new(1024, 8).unwrap();
    let ht: HashTable<Node> = HashTable::new(64, Smr::HazardPointers).unwrap();

    std::thread::scope(|s| {
        for t in 0..2u64 {
            let dom = dom.clone();
            let ht = &ht;
            s.spawn(move || {
                hazptr::register(&dom);
                let mut mine = Vec::new();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    let node = ptr::NonNull::from(Box::leak(Box::new(Node {
                        link: HashLink::new(),
                        key,
                    })));
                    unsafe { ht.insert(node, key % 13) };
                    mine.push((node, key));
                }
                // Remove every other node again.
                for (node, key) in mine.iter().step_by(2) {
                    assert!(unsafe { ht.remove(*node, key % 13) });
                }
                hazptr::unregister();
            });
        }
    });

    let mut count = 0;
    ht.traverse(|_, _| count += 1);
    assert_eq!(count, 2 * PER_THREAD / 2);

    // Drain the table so it drops empty.
    hazptr::register(&dom);
    let mut hp = Hazard::null();
    for key in 0..2 * PER_THREAD {
        if let Some(node) = ht.remove_by_key(&key, key % 13, &mut hp) {
            hazptr::release(&mut hp);
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
    hazptr::unregister();
}
