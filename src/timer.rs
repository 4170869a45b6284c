/*!
Tick-driven timers.

A process-wide array of expiration ticks, scanned linearly from a cached
`earliest` watermark. Time is a monotonic 64-bit tick advanced by
[`tick_set`]; [`expire`] runs the callbacks of every timer whose
expiration is at or before the current tick. Expiring CASes the expiration
to the invalid sentinel first, so each firing happens exactly once even
with concurrent expirers, and a concurrent [`reset`] simply wins the race.

Timer slots are recycled through a freelist whose head carries an ABA
count. Setting a timer has release semantics with respect to the
user data reachable through its argument; expiry acquires it.
*/

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::errhnd;
use crate::MAX_TIMERS;

/// Timer handle.
pub type Timer = u32;

/// Returned when no timer could be allocated.
pub const TIMER_NULL: Timer = u32::MAX;

/// Tick type; monotonically increasing.
pub type Tick = u64;

/// No expiration / inactive.
pub const TICK_INVALID: Tick = u64::MAX;

/// Callback invoked on expiry: `(timer, expiration, arg)`.
pub type TimerCb = fn(Timer, Tick, usize);

struct Entry {
    cb: UnsafeCell<Option<TimerCb>>,
    arg: UnsafeCell<usize>,
    next: UnsafeCell<u32>,
}

// Entries are only written by the freelist owner of the slot.
unsafe impl Sync for Entry {}

const FREE_END: u32 = u32::MAX;

struct TimerState {
    earliest: AtomicU64,
    current: AtomicU64,
    hiwmark: AtomicU32,
    expirations: Box<[AtomicU64]>,
    timers: Box<[Entry]>,
    /// Freelist head index (low 32) and ABA count (high 32).
    freelist: AtomicU64,
}

static STATE: OnceLock<TimerState> = OnceLock::new();

fn state() -> &'static TimerState {
    STATE.get_or_init(|| {
        let timers: Box<[Entry]> = (0..MAX_TIMERS)
            .map(|i| Entry {
                cb: UnsafeCell::new(None),
                arg: UnsafeCell::new(0),
                next: UnsafeCell::new(if i + 1 < MAX_TIMERS {
                    i as u32 + 1
                } else {
                    FREE_END
                }),
            })
            .collect();
        TimerState {
            earliest: AtomicU64::new(TICK_INVALID),
            current: AtomicU64::new(0),
            hiwmark: AtomicU32::new(0),
            expirations: (0..MAX_TIMERS).map(|_| AtomicU64::new(0)).collect(),
            timers,
            freelist: AtomicU64::new(0),
        }
    })
}

#[inline]
fn fl_head(word: u64) -> u32 {
    word as u32
}

#[inline]
fn fl_pack(head: u32, count: u32) -> u64 {
    ((count as u64) << 32) | head as u64
}

/// Conditionally lower the `earliest` watermark.
fn update_earliest(g: &TimerState, exp: Tick) {
    let mut old = g.earliest.load(Ordering::Relaxed);
    loop {
        if exp >= old {
            return;
        }
        match g
            .earliest
            .compare_exchange_weak(old, exp, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => return,
            Err(cur) => old = cur,
        }
    }
}

/// Allocate a timer with its callback and argument, or [`TIMER_NULL`]
/// when all timers are taken.
pub fn alloc(cb: TimerCb, arg: usize) -> Timer {
    let g = state();
    let mut old = g.freelist.load(Ordering::Acquire);
    let idx = loop {
        let head = fl_head(old);
        if head == FREE_END {
            return TIMER_NULL;
        }
        let next = unsafe { *g.timers[head as usize].next.get() };
        match g.freelist.compare_exchange_weak(
            old,
            fl_pack(next, (old >> 32) as u32 + 1),
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => break head,
            Err(cur) => old = cur,
        }
    };
    g.expirations[idx as usize].store(TICK_INVALID, Ordering::Relaxed);
    unsafe {
        *g.timers[idx as usize].cb.get() = Some(cb);
        *g.timers[idx as usize].arg.get() = arg;
    }
    g.hiwmark.fetch_max(idx + 1, Ordering::Release);
    idx
}

/// Free an inactive timer.
pub fn free(idx: Timer) {
    let g = state();
    if idx >= g.hiwmark.load(Ordering::Relaxed) {
        errhnd::report("timer", "invalid timer", idx as usize);
        return;
    }
    if g.expirations[idx as usize].load(Ordering::Acquire) != TICK_INVALID {
        errhnd::report("timer", "cannot free active timer", idx as usize);
        return;
    }
    unsafe {
        *g.timers[idx as usize].cb.get() = None;
    }
    let mut old = g.freelist.load(Ordering::Relaxed);
    loop {
        unsafe { *g.timers[idx as usize].next.get() = fl_head(old) };
        match g.freelist.compare_exchange_weak(
            old,
            fl_pack(idx, (old >> 32) as u32 + 1),
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(cur) => old = cur,
        }
    }
}

fn update_expiration(idx: Timer, exp: Tick, active: bool, order: Ordering) -> bool {
    let g = state();
    if idx >= g.hiwmark.load(Ordering::Relaxed) {
        errhnd::report("timer", "invalid timer", idx as usize);
        return false;
    }
    let loc = &g.expirations[idx as usize];
    let mut old = loc.load(Ordering::Relaxed);
    loop {
        let is_active = old != TICK_INVALID;
        if is_active != active {
            // Inactive when a reset/cancel expected it active, or already
            // active on set.
            return false;
        }
        match loc.compare_exchange_weak(old, exp, order, Ordering::Relaxed) {
            Ok(_) => break,
            Err(cur) => old = cur,
        }
    }
    if exp != TICK_INVALID {
        update_earliest(g, exp);
    }
    true
}

/// Arm an inactive timer. Release-orders the user data behind `arg`.
pub fn set(idx: Timer, exp: Tick) -> bool {
    if exp == TICK_INVALID {
        errhnd::report("timer", "invalid expiration time", idx as usize);
        return false;
    }
    update_expiration(idx, exp, false, Ordering::Release)
}

/// Re-arm an active (not yet expired) timer.
pub fn reset(idx: Timer, exp: Tick) -> bool {
    if exp == TICK_INVALID {
        errhnd::report("timer", "invalid expiration time", idx as usize);
        return false;
    }
    update_expiration(idx, exp, true, Ordering::Release)
}

/// Disarm an active timer; false when it already expired or was inactive.
pub fn cancel(idx: Timer) -> bool {
    update_expiration(idx, TICK_INVALID, true, Ordering::Relaxed)
}

/// Advance the current tick; time never runs backwards.
pub fn tick_set(tck: Tick) {
    if tck == TICK_INVALID {
        errhnd::report("timer", "invalid tick", 0);
        return;
    }
    let g = state();
    let mut old = g.current.load(Ordering::Relaxed);
    loop {
        if tck <= old {
            return;
        }
        match g
            .current
            .compare_exchange_weak(old, tck, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return,
            Err(cur) => old = cur,
        }
    }
}

pub fn tick_get() -> Tick {
    state().current.load(Ordering::Relaxed)
}

fn expire_one(g: &TimerState, now: Tick, idx: usize) {
    let loc = &g.expirations[idx];
    let mut exp = loc.load(Ordering::Relaxed);
    loop {
        if exp > now {
            // Someone re-set the timer (and refreshed `earliest`).
            return;
        }
        match loc.compare_exchange_weak(exp, TICK_INVALID, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => break,
            Err(cur) => exp = cur,
        }
    }
    let cb = unsafe { *g.timers[idx].cb.get() };
    let arg = unsafe { *g.timers[idx].arg.get() };
    if let Some(cb) = cb {
        cb(idx as Timer, exp, arg);
    }
}

/// Run the callbacks of every timer due at the current tick.
pub fn expire() {
    let g = state();
    let now = g.current.load(Ordering::Relaxed);
    if g.earliest.load(Ordering::Relaxed) > now {
        // No timer is due.
        return;
    }
    // Reset `earliest`; our reset must be visible before we scan.
    g.earliest.store(TICK_INVALID, Ordering::Relaxed);
    fence(Ordering::SeqCst);
    let hiw = g.hiwmark.load(Ordering::Acquire) as usize;
    let mut earliest = TICK_INVALID;
    for idx in 0..hiw {
        let exp = g.expirations[idx].load(Ordering::Relaxed);
        if exp <= now {
            expire_one(g, now, idx);
        } else if exp < earliest {
            earliest = exp;
        }
    }
    update_earliest(g, earliest);
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    static FIRED: AtomicUsize = AtomicUsize::new(0);
    // The timer array is process-global: serialise the tests.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn on_expire(_t: Timer, _exp: Tick, arg: usize) {
        FIRED.fetch_add(arg, Ordering::Relaxed);
    }

    #[test]
    fn set_expire_cycle() {
        let _guard = TEST_LOCK.lock().unwrap();
        let t = alloc(on_expire, 3);
        assert_ne!(t, TIMER_NULL);
        let base = tick_get();

        assert!(set(t, base + 10));
        // Arming twice is an error (reported as a plain failure).
        assert!(!set(t, base + 20));

        let before = FIRED.load(Ordering::Relaxed);
        tick_set(base + 5);
        expire();
        assert_eq!(FIRED.load(Ordering::Relaxed), before);

        tick_set(base + 10);
        expire();
        assert_eq!(FIRED.load(Ordering::Relaxed), before + 3);

        // Expired timers are inactive: cancel fails, free succeeds.
        assert!(!cancel(t));
        free(t);
    }

    #[test]
    fn cancel_prevents_firing() {
        let _guard = TEST_LOCK.lock().unwrap();
        let t = alloc(on_expire, 1000);
        assert_ne!(t, TIMER_NULL);
        let base = tick_get();
        assert!(set(t, base + 1));
        assert!(cancel(t));
        let before = FIRED.load(Ordering::Relaxed);
        tick_set(base + 2);
        expire();
        assert_eq!(FIRED.load(Ordering::Relaxed), before);
        free(t);
    }

    #[test]
    fn reset_pushes_expiry_out() {
        let _guard = TEST_LOCK.lock().unwrap();
        let t = alloc(on_expire, 7);
        assert_ne!(t, TIMER_NULL);
        let base = tick_get();
        assert!(set(t, base + 3));
        assert!(reset(t, base + 30));
        let before = FIRED.load(Ordering::Relaxed);
        tick_set(base + 3);
        expire();
        assert_eq!(FIRED.load(Ordering::Relaxed), before);
        tick_set(base + 30);
        expire();
        assert_eq!(FIRED.load(Ordering::Relaxed), before + 7);
        free(t);
    }
}
