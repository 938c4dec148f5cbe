//! Per-thread lock bookkeeping.
//!
//! Every guard handed out by this crate bumps a thread-local depth counter for
//! as long as it lives. The counters back the debug assertions that enforce
//! the lock order (critical section before paint mutex) and the
//! non-re-entrancy of the critical section.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static CRITICAL_DEPTH: Cell<u32> = const { Cell::new(0) };
    static PAINT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the calling thread currently holds a critical section.
pub fn critical_held() -> bool {
    CRITICAL_DEPTH.with(|d| d.get() > 0)
}

/// Number of paint mutexes held by the calling thread.
pub fn paint_depth() -> u32 {
    PAINT_DEPTH.with(|d| d.get())
}

#[derive(Clone, Copy)]
pub(crate) enum LockClass {
    Critical,
    Paint,
}

/// Held by a guard; undoes its increment on drop. Never leaves its thread.
pub(crate) struct DepthToken {
    class: LockClass,
    _not_send: PhantomData<*const ()>,
}

impl DepthToken {
    pub(crate) fn acquire(class: LockClass) -> Self {
        counter(class, |d| d.set(d.get() + 1));
        Self {
            class,
            _not_send: PhantomData,
        }
    }
}

impl Drop for DepthToken {
    fn drop(&mut self) {
        counter(self.class, |d| d.set(d.get().saturating_sub(1)));
    }
}

fn counter(class: LockClass, f: impl FnOnce(&Cell<u32>)) {
    match class {
        LockClass::Critical => CRITICAL_DEPTH.with(f),
        LockClass::Paint => PAINT_DEPTH.with(f),
    }
}
