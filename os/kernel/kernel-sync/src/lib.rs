//! # Kernel synchronization primitives
//!
//! One [`SpinLock`] guards the entire state of each allocator component. Every
//! operation holds the guard for its full body; the guard releases on drop, so
//! early returns, `?` and unwinding all unlock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
