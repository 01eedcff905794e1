//! The write-once stop flag that backs the no-post-stop-callbacks rule and
//! the idempotent `stop()` contract.

use std::sync::atomic::{AtomicBool, Ordering};

/// A monotonic flag: once set, never cleared. Every callback dispatch path
/// must check this before invoking user code.
#[derive(Debug, Default)]
pub struct StopFlag(AtomicBool);

impl StopFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the flag and reports whether *this* call was the one that set
    /// it, so `stop()` can stay idempotent: a second call only checks the
    /// flag and returns.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// Gates a callback dispatch behind the stop flag, so "no callback may fire
/// after `stop()` returns" holds even if the event that would trigger the
/// callback was already in flight when `stop()` ran.
pub fn dispatch<F: FnOnce()>(flag: &StopFlag, f: F) {
    if !flag.is_set() {
        f();
    }
}
