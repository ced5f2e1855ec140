//! One-shot futures awaited by fibers.
//!
//! A [`Future`] carries an exception-like failure description and a typed
//! success payload; it transitions monotonically into a ready state exactly
//! once. Waiters attach a [`WakeToken`] — a weak reference to the waiting
//! fiber's `async_time` cell plus a handle to the scheduler's wake
//! condvar — that is pulsed on readiness (spec §3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::time::SteadyTime;

/// An exception-like failure description carried by a failed [`Future`].
#[derive(Debug, Clone)]
pub struct FutureFailure(pub String);

impl std::fmt::Display for FutureFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FutureFailure {}

#[derive(Debug, Clone)]
enum State<T> {
    Uninitialised,
    Success(T),
    Failure(FutureFailure),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    waiters: Mutex<Vec<WakeToken>>,
}

/// A reference to a waiting fiber's wake cell, pulsed when a future it is
/// watching becomes ready. Cheap to clone; holds only weak references so a
/// future never keeps a suspended fiber alive.
#[derive(Clone)]
pub struct WakeToken {
    async_time: Weak<AtomicU64>,
    wake: Arc<(Mutex<()>, Condvar)>,
}

impl WakeToken {
    pub(crate) fn new(async_time: Weak<AtomicU64>, wake: Arc<(Mutex<()>, Condvar)>) -> Self {
        WakeToken { async_time, wake }
    }

    /// Publishes `now` into the target fiber's `async_time` and notifies
    /// the scheduler's wake condvar so a sleeping `thread_loop` reconsiders
    /// its heap immediately.
    pub fn pulse(&self, now: SteadyTime) {
        if let Some(cell) = self.async_time.upgrade() {
            cell.store(now.as_nanos(), Ordering::Release);
        }
        let (_lock, cvar) = &*self.wake;
        cvar.notify_all();
    }
}

/// The reading half of a one-shot future. Cloning shares the same
/// underlying result.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

/// The writing half of a one-shot future, held by whoever performs the
/// asynchronous work (a task-pool worker, another fiber, a socket
/// callback).
pub struct Resolver<T> {
    inner: Arc<Inner<T>>,
}

/// Creates a linked (future, resolver) pair in the uninitialised state.
pub fn channel<T>() -> (Future<T>, Resolver<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Uninitialised),
        waiters: Mutex::new(Vec::new()),
    });
    (
        Future {
            inner: inner.clone(),
        },
        Resolver { inner },
    )
}

impl<T: Clone> Future<T> {
    pub fn is_ready(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), State::Uninitialised)
    }

    /// Registers a waiter. If the future is already ready, the token is
    /// pulsed immediately instead of being stored.
    pub(crate) fn attach_waiter(&self, token: WakeToken, now: SteadyTime) {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(*state, State::Uninitialised) {
            drop(state);
            self.inner.waiters.lock().unwrap().push(token);
        } else {
            drop(state);
            token.pulse(now);
        }
    }

    /// Reads the result, if ready. Does not block.
    pub fn try_get(&self) -> Option<Result<T, FutureFailure>> {
        match &*self.inner.state.lock().unwrap() {
            State::Uninitialised => None,
            State::Success(v) => Some(Ok(v.clone())),
            State::Failure(e) => Some(Err(e.clone())),
        }
    }
}

impl<T> Resolver<T> {
    pub fn resolve_success(self, value: T, now: SteadyTime) {
        self.finish(State::Success(value), now);
    }

    pub fn resolve_failure(self, failure: FutureFailure, now: SteadyTime) {
        self.finish(State::Failure(failure), now);
    }

    fn finish(self, new_state: State<T>, now: SteadyTime) {
        {
            let mut state = self.inner.state.lock().unwrap();
            debug_assert!(
                matches!(*state, State::Uninitialised),
                "future resolved more than once"
            );
            *state = new_state;
        }
        for waiter in self.inner.waiters.lock().unwrap().drain(..) {
            waiter.pulse(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_then_read_success() {
        let (future, resolver) = channel::<i32>();
        assert!(!future.is_ready());
        resolver.resolve_success(42, SteadyTime::now());
        assert!(future.is_ready());
        assert_eq!(future.try_get().unwrap().unwrap(), 42);
    }

    #[test]
    fn resolve_then_read_failure() {
        let (future, resolver) = channel::<i32>();
        resolver.resolve_failure(FutureFailure("boom".into()), SteadyTime::now());
        assert!(future.try_get().unwrap().is_err());
    }

    #[test]
    fn waiter_attached_after_ready_is_pulsed_immediately() {
        let (future, resolver) = channel::<i32>();
        resolver.resolve_success(1, SteadyTime::now());

        let cell = Arc::new(AtomicU64::new(0));
        let wake = Arc::new((Mutex::new(()), Condvar::new()));
        let token = WakeToken::new(Arc::downgrade(&cell), wake);
        future.attach_waiter(token, SteadyTime::now());
        assert!(cell.load(Ordering::Acquire) > 0);
    }
}
