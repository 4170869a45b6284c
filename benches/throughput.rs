use std::ptr::NonNull;

use criterion::{criterion_group, criterion_main, Criterion};

use manycore::hashtable::{HashEntry, HashLink, HashTable};
use manycore::hazptr::{self, Hazard, HpDomain};
use manycore::ringbuf::{Consumer, Producer, RingBuf};
use manycore::spinlock::SpinLock;
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

fn bench_hashtable_lookup(c: &mut Criterion) {
    let dom = HpDomain::new(1024, 8).unwrap();
    hazptr::register(&dom);
    let ht: HashTable<Item> = HashTable::new(1024, Smr::HazardPointers).unwrap();
    let items: Vec<_> = (0..1024u64)
        .map(|key| {
            let node = NonNull::from(Box::leak(Box::new(Item {
                link: HashLink::new(),
                key,
            })));
            unsafe { ht.insert(node, key) };
            node
        })
        .collect();

    let mut hp = Hazard::null();
    let mut key = 0u64;
    c.bench_function("hashtable_lookup_hit", |b| {
        b.iter(|| {
            key = (key + 1) & 1023;
            let found = ht.lookup(&key, key, &mut hp);
            hazptr::release(&mut hp);
            found
        })
    });

    for node in items {
        let key = unsafe { node.as_ref() }.key;
        unsafe { ht.remove(node, key) };
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }
    hazptr::unregister();
}

fn bench_ringbuf(c: &mut Criterion) {
    let rb = RingBuf::new(1024, Producer::MultiBlocking, Consumer::MultiBlocking).unwrap();
    let mut out = [0u64; 16];
    c.bench_function("ringbuf_enqueue_dequeue_16", |b| {
        b.iter(|| {
            let n = rb.enqueue(&[1u64, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
            let (m, _) = rb.dequeue(&mut out);
            (n, m)
        })
    });
}

fn bench_spinlock(c: &mut Criterion) {
    let lock = SpinLock::new();
    let mut counter = 0u64;
    c.bench_function("spinlock_uncontended", |b| {
        b.iter(|| {
            lock.acquire();
            counter = counter.wrapping_add(1);
            lock.release();
            counter
        })
    });
}

criterion_group!(
    benches,
    bench_hashtable_lookup,
    bench_ringbuf,
    bench_spinlock
);
criterion_main!(benches);
