use crate::order;
use crate::LockError;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Manual-reset event for awaiting posted UI-thread work, carrying the
/// handler's outcome.
///
/// One outstanding use at a time: the waiter resets it, posts the work, then
/// waits; the handler signals on every exit path through [`SignalOnDrop`].
/// Once signaled it stays signaled until the next reset.
pub struct CompletionEvent<T = ()> {
    name: &'static str,
    state: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> CompletionEvent<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reset(&self) {
        *self.state.lock() = None;
    }

    pub fn signal(&self, outcome: T) {
        let mut state = self.state.lock();
        *state = Some(outcome);
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Wait with no timeout. The UI thread never waits on the interpreter,
    /// so the only requirement is that the handler eventually signals.
    pub fn wait(&self) -> T {
        debug_assert!(
            !order::critical_held(),
            "waiting on `{}` while holding the critical section",
            self.name
        );
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<T, LockError> {
        let mut state = self.state.lock();
        if state.is_none() {
            let _ = self
                .cond
                .wait_while_for(&mut state, |s| s.is_none(), timeout);
        }
        state
            .as_ref()
            .cloned()
            .ok_or_else(|| LockError::timeout(self.name, timeout))
    }
}

impl<T> fmt::Debug for CompletionEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("name", &self.name)
            .finish()
    }
}

/// Signals its event when dropped, so a handler that returns early, fails,
/// unwinds, or is never run at all still releases the waiter.
///
/// Starts out holding the outcome reported when the work is abandoned;
/// [`complete`](Self::complete) replaces it with the real one.
pub struct SignalOnDrop<T: Clone> {
    event: Arc<CompletionEvent<T>>,
    outcome: Option<T>,
}

impl<T: Clone> SignalOnDrop<T> {
    pub fn new(event: Arc<CompletionEvent<T>>, abandoned: T) -> Self {
        Self {
            event,
            outcome: Some(abandoned),
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.event.name()
    }

    pub fn complete(mut self, outcome: T) {
        self.outcome = Some(outcome);
    }
}

impl<T: Clone> Drop for SignalOnDrop<T> {
    fn drop(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            self.event.signal(outcome);
        }
    }
}

impl<T: Clone> fmt::Debug for SignalOnDrop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalOnDrop")
            .field("event", &self.event.name())
            .finish()
    }
}

/// A [`CompletionEvent`] created on first use.
pub struct LazyEvent<T = ()> {
    name: &'static str,
    cell: OnceCell<Arc<CompletionEvent<T>>>,
}

impl<T: Clone> LazyEvent<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Arc<CompletionEvent<T>> {
        self.cell
            .get_or_init(|| {
                tracing::debug!("creating completion event `{}`", self.name);
                Arc::new(CompletionEvent::new(self.name))
            })
            .clone()
    }

    pub fn is_created(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_after_signal_from_other_thread() {
        let event = Arc::new(CompletionEvent::<u32>::new("erase"));
        event.reset();
        let signaler = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                event.signal(7);
            })
        };
        assert_eq!(event.wait(), 7);
        assert!(event.is_signaled());
        signaler.join().unwrap();
    }

    #[test]
    fn test_reset_rearms() {
        let event = CompletionEvent::<()>::new("erase");
        event.signal(());
        assert!(event.wait_for(Duration::from_millis(1)).is_ok());
        // Manual reset: still signaled until reset.
        assert!(event.wait_for(Duration::from_millis(1)).is_ok());
        event.reset();
        assert!(event.wait_for(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_signal_on_drop_covers_failure_paths() {
        fn handler(done: SignalOnDrop<Result<(), String>>, fail: bool) -> Result<(), String> {
            if fail {
                return Err("native call failed".into());
            }
            done.complete(Ok(()));
            Ok(())
        }

        let event = Arc::new(CompletionEvent::new("erase"));
        let abandoned = || Err("abandoned".to_string());

        assert!(handler(SignalOnDrop::new(event.clone(), abandoned()), true).is_err());
        assert_eq!(event.wait(), Err("abandoned".to_string()));

        event.reset();
        assert!(handler(SignalOnDrop::new(event.clone(), abandoned()), false).is_ok());
        assert_eq!(event.wait(), Ok(()));

        event.reset();
        let unwinding = {
            let done = SignalOnDrop::new(event.clone(), abandoned());
            thread::spawn(move || {
                let _done = done;
                panic!("handler blew up");
            })
        };
        assert!(unwinding.join().is_err());
        assert!(event.is_signaled());
    }

    #[test]
    fn test_lazy_event_created_once() {
        let lazy: LazyEvent<()> = LazyEvent::new("droplist");
        assert!(!lazy.is_created());
        let a = lazy.get();
        let b = lazy.get();
        assert!(lazy.is_created());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "droplist");
    }
}
