/*!
Concurrent data structures and synchronization primitives for shared-memory
multiprocessors.

The crate is built around a small set of interlocking foundations:

- Safe memory reclamation: [`hazptr`] (hazard pointers) and [`qsbr`]
  (quiescent-state based reclamation), interchangeable behind [`smr::Smr`].
- Reclamation-aware containers: [`stack`], [`msqueue`], [`buckring`],
  [`ringbuf`], [`lfring`], [`hashtable`], [`hopscotch`], [`cuckoo`] and the
  longest-prefix-match trie [`mbtrie`].
- Queue locks and fair read/write locks: [`spinlock`], [`tktlock`],
  [`clhlock`], [`mcslock`], [`hemlock`], [`rplock`], [`rwlock`],
  [`tfrwlock`], [`pflock`], [`rwsync`], [`rwclhlock`], [`skiplock`],
  [`semaphore`] and [`barrier`].
- Stackful coroutines and cooperative fibers built on a raw context switch:
  [`crosscall`], [`coroutine`], [`fiber`].

Supporting components: [`reorder`], [`reassemble`], [`mcas`], [`timer`] and
[`counter`].

Programmer errors and resource exhaustion are routed through the pluggable
error handler in [`errhnd`]; empty/full conditions are ordinary return
values and lost races are always retried internally.
*/

pub(crate) mod sync;
pub(crate) mod tidx;
pub(crate) mod utils;

pub mod errhnd;

pub mod hazptr;
pub mod qsbr;
pub mod smr;

pub mod barrier;
pub mod clhlock;
pub mod hemlock;
pub mod mcslock;
pub mod pflock;
pub mod rplock;
pub mod rwclhlock;
pub mod rwlock;
pub mod rwsync;
pub mod semaphore;
pub mod skiplock;
pub mod spinlock;
pub mod tfrwlock;
pub mod tktlock;

pub mod buckring;
pub mod lfring;
pub mod msqueue;
pub mod ringbuf;
pub mod stack;

pub mod cuckoo;
pub mod hashtable;
pub mod hopscotch;
pub mod mbtrie;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod crosscall;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod coroutine;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod fiber;

pub mod counter;
pub mod mcas;
pub mod reassemble;
pub mod reorder;
pub mod timer;

/// Cache line size the crate lays data out for.
pub const CACHE_LINE: usize = 64;

/// Maximum number of threads that may register with any domain.
pub const MAX_THREADS: usize = 128;

/// Maximum number of timers in the global timer array.
pub const MAX_TIMERS: usize = 8192;

pub use crate::hazptr::{Hazard, HpDomain};
pub use crate::qsbr::QsbrDomain;
pub use crate::smr::Smr;
