use crate::order::{DepthToken, LockClass};
use crate::LockError;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, MutexGuard, RawMutex};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// Per-pixmap lock. All code that alters a bitmap or paints it from the
/// bitmap holds this first.
///
/// Cloning shares the same lock.
pub struct PaintMutex<T> {
    name: Arc<str>,
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for PaintMutex<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> PaintMutex<T> {
    pub fn new(name: impl Into<Arc<str>>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Whether both values refer to the same lock.
    pub fn same_lock(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait at most `timeout` for the lock. Repaint uses this so that a draw
    /// session on the interpreter thread can never stall the message pump.
    pub fn lock_for(&self, timeout: Duration) -> Result<PaintGuard<'_, T>, LockError> {
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Ok(PaintGuard {
                guard,
                _depth: DepthToken::acquire(LockClass::Paint),
            }),
            None => {
                tracing::trace!("paint lock `{}` busy after {:?}", self.name, timeout);
                Err(LockError::timeout(&*self.name, timeout))
            }
        }
    }

    /// Block until the lock is free. The returned guard keeps the lock alive
    /// independently of `self`, for draw sessions spanning many calls.
    pub fn lock_owned(&self) -> OwnedPaintGuard<T> {
        let guard = self.inner.lock_arc();
        OwnedPaintGuard {
            guard,
            _depth: DepthToken::acquire(LockClass::Paint),
        }
    }

    pub fn try_lock_owned_for(&self, timeout: Duration) -> Result<OwnedPaintGuard<T>, LockError> {
        self.inner
            .try_lock_arc_for(timeout)
            .map(|guard| OwnedPaintGuard {
                guard,
                _depth: DepthToken::acquire(LockClass::Paint),
            })
            .ok_or_else(|| LockError::timeout(&*self.name, timeout))
    }
}

impl<T> std::fmt::Debug for PaintMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaintMutex")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Borrowing guard from [`PaintMutex::lock_for`].
pub struct PaintGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _depth: DepthToken,
}

impl<T> Deref for PaintGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for PaintGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Owning guard from [`PaintMutex::lock_owned`]. Released on drop, on every
/// exit path of the draw sequence that holds it.
pub struct OwnedPaintGuard<T> {
    guard: ArcMutexGuard<RawMutex, T>,
    _depth: DepthToken,
}

impl<T> Deref for OwnedPaintGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OwnedPaintGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
