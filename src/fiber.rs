/*!
Cooperative fibers with round-robin scheduling and a barrier.

Fibers are symmetric: [`yield_now`] cross-calls from the current fiber to
the next one on a circular singly-linked list of runnable fibers. A fiber
is spawned onto a caller-owned stack and runs immediately to consume its
argument; its first yield returns control to the spawner. [`run`] enters
the scheduler from the main thread of control and returns when every fiber
has exited.

[`barrier`] parks fibers (by yielding) until all of them have arrived; the
first fiber to leave the barrier resets it.

Everything is single-threaded: fibers never migrate between OS threads.
*/

use std::cell::UnsafeCell;
use std::ptr;

use crate::crosscall::{cross_call, Context};
use crate::errhnd;

/// A fiber: saved context plus its scheduler link.
pub struct Fiber {
    ctx: Context,
    nxt: *mut Fiber,
}

impl Fiber {
    pub const fn new() -> Self {
        Self {
            ctx: Context::new(),
            nxt: ptr::null_mut(),
        }
    }
}

impl Default for Fiber {
    fn default() -> Self {
        Self::new()
    }
}

struct FiberState {
    fcnt: u32,
    bcnt: u32,
    list: *mut Fiber,
    cur: *mut Fiber,
    main: Fiber,
}

thread_local! {
    static STATE: UnsafeCell<FiberState> = const {
        UnsafeCell::new(FiberState {
            fcnt: 0,
            bcnt: 0,
            list: ptr::null_mut(),
            cur: ptr::null_mut(),
            main: Fiber::new(),
        })
    };
}

#[inline]
fn state() -> *mut FiberState {
    STATE.with(|s| s.get())
}

/// Remove `q` from the circular list.
unsafe fn remove_element(st: *mut FiberState, q: *mut Fiber) {
    unsafe {
        let mut p = (*st).list;
        while (*p).nxt != q {
            p = (*p).nxt;
        }
        (*p).nxt = (*q).nxt;
        (*st).fcnt -= 1;
        if (*st).fcnt != 0 {
            if (*st).list == q {
                (*st).list = (*q).nxt;
            }
        } else {
            (*st).list = ptr::null_mut();
        }
        if !std::ptr::eq(q, &(*st).main) {
            (*q).nxt = ptr::null_mut();
        } else {
            (*q).nxt = q;
        }
    }
}

/// Insert `q` before `p` (or into the empty list when `p` is null).
unsafe fn insert_element_before(st: *mut FiberState, p: *mut Fiber, q: *mut Fiber) {
    unsafe {
        if !p.is_null() {
            let mut b = (*st).list;
            while (*b).nxt != p {
                b = (*b).nxt;
            }
            (*q).nxt = p;
            (*b).nxt = q;
            (*st).fcnt += 1;
        } else {
            (*q).nxt = q;
            (*st).list = q;
            (*st).fcnt = 1;
        }
    }
}

struct SpawnArgs {
    entry: extern "C" fn(usize),
    arg: usize,
}

extern "C" fn trampoline(arg: usize) -> ! {
    let wargs = unsafe { &*(arg as *const SpawnArgs) };
    let (entry, arg) = (wargs.entry, wargs.arg);
    entry(arg);
    exit()
}

/// Spawn a fiber on the caller-supplied stack; it runs immediately to
/// consume `arg` and control returns here at its first yield.
///
/// # Safety
///
/// The stack must stay valid and untouched for the fiber's lifetime, and
/// `fbr` must stay in place until the fiber exits.
pub unsafe fn spawn(
    fbr: &mut Fiber,
    entry: extern "C" fn(usize),
    stack_base: *mut u8,
    stack_size: usize,
    arg: usize,
) {
    let st = state();
    unsafe {
        if (*st).cur.is_null() {
            (*st).cur = &mut (*st).main;
            (*st).main.nxt = &mut (*st).main;
        }
        // Insert main to guarantee a non-empty list while we are away.
        let main = &mut (*st).main as *mut Fiber;
        insert_element_before(st, (*st).list, main);
        fbr.ctx = Context::prepare(trampoline, stack_base, stack_size);
        // The new fiber goes in front of the current one, so its first
        // yield comes straight back to us.
        let saved = (*st).cur;
        insert_element_before(st, saved, fbr);
        debug_assert_eq!(fbr.nxt, saved);
        let wargs = SpawnArgs { entry, arg };
        (*st).cur = fbr;
        cross_call(
            &wargs as *const SpawnArgs as usize,
            &mut (*saved).ctx,
            &fbr.ctx,
        );
        (*st).cur = saved;
        // Main has served its purpose.
        remove_element(st, main);
    }
}

/// Yield to the next runnable fiber.
pub fn yield_now() {
    let st = state();
    unsafe {
        let out = (*st).cur;
        let inp = (*out).nxt;
        (*st).cur = inp;
        cross_call(0, &mut (*out).ctx, &(*inp).ctx);
    }
}

/// Exit the calling fiber; control passes to the next fiber, or back to
/// [`run`] when none remain.
pub fn exit() -> ! {
    let st = state();
    unsafe {
        if (*st).cur.is_null() || std::ptr::eq((*st).cur, &(*st).main) {
            errhnd::report("fiber", "non-fiber called exit", 0);
            std::process::abort();
        }
        let out = (*st).cur;
        let inp = (*out).nxt;
        remove_element(st, out);
        if (*st).fcnt != 0 {
            (*st).cur = inp;
            cross_call(0, &mut (*out).ctx, &(*inp).ctx);
        } else {
            (*st).cur = &mut (*st).main;
            cross_call(1, &mut (*out).ctx, &(*st).main.ctx);
        }
    }
    // An exited fiber is never entered again.
    std::process::abort()
}

/// Run fibers until all of them have exited. Must be called from the main
/// thread of control, not from a fiber.
pub fn run() {
    let st = state();
    unsafe {
        if !(*st).cur.is_null() && !std::ptr::eq((*st).cur, &(*st).main) {
            errhnd::report("fiber", "fiber called run", 0);
            return;
        }
        if (*st).fcnt != 0 {
            (*st).cur = (*st).list;
            if !(*st).cur.is_null() {
                let cur = (*st).cur;
                cross_call(1, &mut (*st).main.ctx, &(*cur).ctx);
            }
            (*st).cur = &mut (*st).main;
        }
        // Else no fibers exist.
    }
}

/// Block the calling fiber until every fiber has reached the barrier; each
/// fiber leaves exactly once per call.
pub fn barrier() {
    let st = state();
    unsafe {
        if (*st).cur.is_null() || std::ptr::eq((*st).cur, &(*st).main) {
            errhnd::report("fiber", "non-fiber called barrier", 0);
            return;
        }
        // One more fiber is waiting.
        let me = (*st).bcnt;
        (*st).bcnt += 1;
        while (*st).bcnt != (*st).fcnt {
            // Let the other fibers reach the barrier.
            yield_now();
        }
        // All fibers have arrived; they now leave one by one.
        let is_first_to_leave = me == (*st).fcnt - 1;
        yield_now();
        if is_first_to_leave {
            (*st).bcnt = 0;
        }
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    static TRACE: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn appender(arg: usize) {
        for _ in 0..3 {
            TRACE.fetch_add(arg, Relaxed);
            yield_now();
        }
    }

    #[test]
    fn round_robin_until_done() {
        TRACE.store(0, Relaxed);
        let mut s1 = vec![0u8; 32 * 1024];
        let mut s2 = vec![0u8; 32 * 1024];
        let mut f1 = Fiber::new();
        let mut f2 = Fiber::new();
        unsafe {
            spawn(&mut f1, appender, s1.as_mut_ptr(), s1.len(), 1);
            spawn(&mut f2, appender, s2.as_mut_ptr(), s2.len(), 10);
        }
        run();
        assert_eq!(TRACE.load(Relaxed), 33);
    }

    static ROUNDS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn barrier_worker(_arg: usize) {
        for r in 0..5 {
            // All fibers must be in the same round when they meet.
            assert_eq!(ROUNDS.load(Relaxed), r);
            barrier();
            ROUNDS.compare_exchange(r, r + 1, Relaxed, Relaxed).ok();
            barrier();
        }
    }

    #[test]
    fn barrier_rounds() {
        ROUNDS.store(0, Relaxed);
        let mut stacks: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 32 * 1024]).collect();
        let mut fibers: Vec<Fiber> = (0..3).map(|_| Fiber::new()).collect();
        for (f, s) in fibers.iter_mut().zip(stacks.iter_mut()) {
            unsafe { spawn(f, barrier_worker, s.as_mut_ptr(), s.len(), 0) };
        }
        run();
        assert_eq!(ROUNDS.load(Relaxed), 5);
    }
}
