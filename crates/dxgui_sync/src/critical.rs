use crate::order::{self, DepthToken, LockClass};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

/// The process-wide lock guarding the shared object graph.
///
/// Not re-entrant: entering twice on one thread deadlocks, and debug builds
/// assert before that happens. The UI thread holds it for at most one queued
/// command at a time.
pub struct CriticalSection<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> CriticalSection<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until the section is free and enter it.
    pub fn enter(&self) -> CriticalGuard<'_, T> {
        debug_assert!(
            !order::critical_held(),
            "critical section `{}` is not re-entrant",
            self.name
        );
        debug_assert!(
            order::paint_depth() == 0,
            "critical section `{}` entered while holding a paint lock",
            self.name
        );
        let guard = self.inner.lock();
        CriticalGuard {
            guard,
            _depth: DepthToken::acquire(LockClass::Critical),
        }
    }

    pub fn try_enter(&self) -> Option<CriticalGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        Some(CriticalGuard {
            guard,
            _depth: DepthToken::acquire(LockClass::Critical),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Scoped ownership of a [`CriticalSection`]; leaving scope releases it on
/// every exit path.
pub struct CriticalGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _depth: DepthToken,
}

impl<T> Deref for CriticalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CriticalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_enter_serializes_writers() {
        let section = Arc::new(CriticalSection::new("graph", Vec::new()));
        let workers: Vec<_> = (0..4)
            .map(|n| {
                let section = section.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        let mut g = section.enter();
                        // A torn read-modify-write would lose entries.
                        let len = g.len();
                        g.push(n * 1000 + i);
                        assert_eq!(g.len(), len + 1);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(section.enter().len(), 1000);
    }

    #[test]
    fn test_try_enter_fails_while_held_elsewhere() {
        let section = Arc::new(CriticalSection::new("graph", 0u32));
        let held = section.enter();
        let other = section.clone();
        let got = thread::spawn(move || other.try_enter().is_none())
            .join()
            .unwrap();
        assert!(got);
        assert!(section.is_locked());
        drop(held);
        assert!(!section.is_locked());
    }

    #[test]
    fn test_guard_tracks_depth() {
        let section = CriticalSection::new("graph", ());
        {
            let _g = section.enter();
            assert!(order::critical_held());
        }
        assert!(!order::critical_held());
    }
}
