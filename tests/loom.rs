//! Model-checked interleavings of the single-word primitives. Only
//! compiled under `RUSTFLAGS="--cfg loom" cargo test --test loom
//! --profile loom`.

#![cfg(loom)]

use loom::sync::atomic::{AtomicU32, Ordering};
use loom::sync::Arc;
use loom::thread;

use manycore::rwsync::RwSync;
use manycore::spinlock::SpinLock;

#[test]
fn spinlock_mutual_exclusion() {
    loom::model(|| {
        let lock = Arc::new(SpinLock::new());
        let data = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    lock.acquire();
                    let v = data.load(Ordering::Relaxed);
                    data.store(v + 1, Ordering::Relaxed);
                    lock.release();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(data.load(Ordering::Relaxed), 2);
    });
}

#[test]
fn seqlock_readers_validate() {
    loom::model(|| {
        let sync = Arc::new(RwSync::new());
        let a = Arc::new(AtomicU32::new(0));
        let b = Arc::new(AtomicU32::new(0));

        let writer = {
            let sync = Arc::clone(&sync);
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            thread::spawn(move || {
                sync.acquire_wr();
                a.store(1, Ordering::Relaxed);
                b.store(1, Ordering::Relaxed);
                sync.release_wr();
            })
        };

        let reader = {
            let sync = Arc::clone(&sync);
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            thread::spawn(move || loop {
                let t = sync.acquire_rd();
                let ra = a.load(Ordering::Relaxed);
                let rb = b.load(Ordering::Relaxed);
                if sync.release_rd(t) {
                    // A validated read is never torn.
                    assert_eq!(ra, rb);
                    break;
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    });
}
