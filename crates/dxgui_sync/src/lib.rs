//! Locks and handshakes shared by the interpreter thread and the UI thread.
//!
//! Three primitives live here:
//! - [`CriticalSection`]: the process-wide lock over the shared object graph.
//! - [`PaintMutex`]: one lock per pixel map, held across a whole draw session
//!   and taken with a bounded wait by repaint.
//! - [`CompletionEvent`]: a manual-reset event for posted work whose result
//!   outlives one round trip.
//!
//! Lock order is always critical section first, paint mutex second. Debug
//! builds assert it through the per-thread bookkeeping in [`order`].

use std::time::Duration;
use thiserror::Error;

mod critical;
mod event;
pub mod order;
mod paint;

pub use critical::{CriticalGuard, CriticalSection};
pub use event::{CompletionEvent, LazyEvent, SignalOnDrop};
pub use paint::{OwnedPaintGuard, PaintGuard, PaintMutex};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock `{name}` acquisition timed out after {waited:?}")]
    Timeout { name: String, waited: Duration },
}

impl LockError {
    pub fn timeout(name: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            name: name.into(),
            waited,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
