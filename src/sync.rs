//! Atomic shim: `std::sync::atomic` normally, `loom::sync::atomic` when the
//! model checker is driving (`--cfg loom`). Only the single-word primitives
//! that the loom tests exercise route through this module; everything that
//! needs 128-bit atomics uses `portable_atomic` directly.

#[cfg(loom)]
pub(crate) use loom::sync::atomic;

#[cfg(not(loom))]
pub(crate) use std::sync::atomic;
