/*!
Asymmetric stackful coroutines with lateral transfers.

A coroutine is spawned onto a caller-owned stack and runs immediately so it
can consume its argument; control returns to the spawner at the coroutine's
first [`suspend`]. From then on the parent drives it with [`resume`], the
coroutine yields with [`suspend`], and sibling coroutines may transfer
control laterally with [`switch_to`] — the target's next suspend still
returns to the original parent.

The parent pointer is stacked per `resume` call, so nested
parent → child → grandchild relations compose. All of this is cooperative
and strictly single-threaded: a coroutine never migrates between OS
threads.

# Example

```
use manycore::coroutine::{self, Coroutine};

extern "C" fn worker(arg: usize) -> usize {
    // First suspend hands `arg * 2` back to spawn.
    let next = coroutine::suspend(arg * 2);
    next + 1
}

let mut stack = vec![0u8; 16 * 1024];
let mut cr = Coroutine::new();
let first = unsafe {
    coroutine::spawn(&mut cr, worker, stack.as_mut_ptr(), stack.len(), 21)
};
assert_eq!(first, 42);
// Resume once more; the coroutine returns (and parks in `ret`).
assert_eq!(coroutine::resume(&mut cr, 7), 8);
```
*/

use std::cell::UnsafeCell;

use crate::crosscall::{cross_call, Context};
use crate::errhnd;

/// A coroutine's saved context.
pub type Coroutine = Context;

struct CoroState {
    parent: *mut Context,
    current: *mut Context,
    main: Context,
}

thread_local! {
    static STATE: UnsafeCell<CoroState> = const {
        UnsafeCell::new(CoroState {
            parent: std::ptr::null_mut(),
            current: std::ptr::null_mut(),
            main: Context::new(),
        })
    };
}

#[inline]
fn state() -> *mut CoroState {
    STATE.with(|s| s.get())
}

struct SpawnArgs {
    entry: extern "C" fn(usize) -> usize,
    arg: usize,
}

extern "C" fn trampoline(arg: usize) -> ! {
    let wargs = unsafe { &*(arg as *const SpawnArgs) };
    let (entry, arg) = (wargs.entry, wargs.arg);
    let r = entry(arg);
    ret(r)
}

/// Spawn a coroutine on the caller-supplied stack and run it until its
/// first [`suspend`]; that suspend's argument is returned.
///
/// # Safety
///
/// The stack must stay valid (and otherwise untouched) for the lifetime of
/// the coroutine, and `cr` must stay in place while the coroutine exists.
pub unsafe fn spawn(
    cr: &mut Coroutine,
    entry: extern "C" fn(usize) -> usize,
    stack_base: *mut u8,
    stack_size: usize,
    arg: usize,
) -> usize {
    let st = state();
    unsafe {
        if (*st).current.is_null() {
            (*st).current = &mut (*st).main;
        }
        *cr = Context::prepare(trampoline, stack_base, stack_size);
    }
    let wargs = SpawnArgs { entry, arg };
    // Run the coroutine so it can consume its argument; the args live in
    // this frame and stay valid until we are resumed.
    resume(cr, &wargs as *const SpawnArgs as usize)
}

/// Suspend the caller and resume execution in the child coroutine. Returns
/// the argument of the child's next [`suspend`].
pub fn resume(cr: &mut Coroutine, arg: usize) -> usize {
    let st = state();
    unsafe {
        let parent = (*st).parent;
        let current = (*st).current;
        (*st).parent = current;
        (*st).current = cr;
        let arg = cross_call(arg, current, cr);
        (*st).parent = parent;
        arg
    }
}

/// Suspend the calling coroutine and resume its parent. Returns the
/// argument of the parent's next [`resume`].
pub fn suspend(arg: usize) -> usize {
    let st = state();
    unsafe {
        let parent = (*st).parent;
        let current = (*st).current;
        (*st).current = parent;
        // The parent restores `parent` itself after its cross-call.
        cross_call(arg, current, parent)
    }
}

/// Lateral transfer to another coroutine without touching the parent: the
/// target's next [`suspend`] returns to the original parent.
pub fn switch_to(cr: &mut Coroutine, arg: usize) -> usize {
    let st = state();
    unsafe {
        let current = (*st).current;
        (*st).current = cr;
        cross_call(arg, current, cr)
    }
}

/// Terminate the calling coroutine, handing `arg` to the parent. Resuming
/// a ceased coroutine aborts.
pub fn ret(arg: usize) -> ! {
    let st = state();
    unsafe {
        if std::ptr::eq((*st).current, &(*st).main) {
            errhnd::report("coroutine", "return from non-coroutine", 0);
            std::process::abort();
        }
    }
    // Keep suspending; a well-behaved parent never resumes us again.
    let _ = suspend(arg);
    errhnd::report("coroutine", "resume of ceased coroutine", 0);
    std::process::abort()
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn doubler(arg: usize) -> usize {
        let mut v = arg;
        loop {
            v = suspend(v * 2);
        }
    }

    #[test]
    fn spawn_runs_to_first_suspend() {
        let mut stack = vec![0u8; 32 * 1024];
        let mut cr = Coroutine::new();
        let first = unsafe { spawn(&mut cr, doubler, stack.as_mut_ptr(), stack.len(), 5) };
        assert_eq!(first, 10);
        assert_eq!(resume(&mut cr, 6), 12);
        assert_eq!(resume(&mut cr, 7), 14);
    }

    extern "C" fn inner(arg: usize) -> usize {
        suspend(arg + 1);
        0
    }

    extern "C" fn outer(arg: usize) -> usize {
        // Nested spawn: parent/child relations must stack.
        let mut stack = vec![0u8; 32 * 1024];
        let mut cr = Coroutine::new();
        let got = unsafe { spawn(&mut cr, inner, stack.as_mut_ptr(), stack.len(), arg) };
        suspend(got + 100);
        0
    }

    #[test]
    fn nested_coroutines_compose() {
        let mut stack = vec![0u8; 32 * 1024];
        let mut cr = Coroutine::new();
        let got = unsafe { spawn(&mut cr, outer, stack.as_mut_ptr(), stack.len(), 1) };
        assert_eq!(got, 102);
    }
}
