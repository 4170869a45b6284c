/*!
Pluggable error handler.

Programmer errors (invalid arguments, duplicate insertion, releasing a lock
that is not held) and resource exhaustion (retire list full after reclaim,
too many registered threads) are reported here. The installed callback
decides whether the process aborts, exits, or whether the failing call
returns its conventional failure sentinel.

Lost CAS races are never reported (they are retried internally) and
empty/full conditions are plain return values.
*/

use std::cell::Cell;

/// What the process should do about a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrAction {
    /// Call `std::process::abort()`. This is the default.
    Abort,
    /// Call `std::process::exit(1)`.
    Exit,
    /// Return to the caller; the failing call returns its failure sentinel.
    Return,
}

/// User-defined error handler.
///
/// Invoked as `cb(module, error, value)` where `module` is a short lowercase
/// identifier (e.g. `"hopscotch"`, `"mcas"`, `"buckring"`) and `error` is a
/// short fixed phrase (e.g. `"invalid flags"`, `"hash table not empty"`).
pub type ErrHandler = fn(module: &str, error: &str, val: usize) -> ErrAction;

thread_local! {
    static HANDLER: Cell<Option<ErrHandler>> = const { Cell::new(None) };
}

/// Install an error handler for the calling thread, returning the previous
/// one. Pass `None` to uninstall.
pub fn install(new: Option<ErrHandler>) -> Option<ErrHandler> {
    HANDLER.with(|h| h.replace(new))
}

/// Report an error through the installed handler.
///
/// Without a handler the error is printed to stderr and the process aborts.
/// With a handler, the returned [`ErrAction`] is obeyed; on
/// [`ErrAction::Return`] this function returns and the caller must produce
/// its failure sentinel.
pub(crate) fn report(module: &str, error: &str, val: usize) {
    let action = match HANDLER.with(|h| h.get()) {
        Some(cb) => cb(module, error, val),
        None => {
            eprintln!("{module}: {error} ({val:#x})");
            ErrAction::Abort
        }
    };
    match action {
        ErrAction::Abort => std::process::abort(),
        ErrAction::Exit => std::process::exit(1),
        ErrAction::Return => (),
    }
}

// -------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ignore(_m: &str, _e: &str, _v: usize) -> ErrAction {
        ErrAction::Return
    }

    #[test]
    fn install_returns_previous() {
        assert_eq!(install(Some(ignore)), None);
        assert_eq!(install(None), Some(ignore as ErrHandler));
    }

    #[test]
    fn return_action_reaches_caller() {
        install(Some(ignore));
        report("test", "synthetic error", 42);
        install(None);
    }
}
