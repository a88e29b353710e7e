//! One-shot cancellation token.
//!
//! Uses `Mutex + Condvar` from std, so waiters block without polling.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Inner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// A cloneable, one-shot cancellation signal.
///
/// All clones share the same state. The first [`cancel()`](CancelToken::cancel)
/// wakes every waiter; later calls have no effect.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Token cancelled by a timer thread once `after` has elapsed.
    pub fn cancel_after(after: Duration) -> Self {
        let token = Self::new();
        let timer = token.clone();
        let spawned = std::thread::Builder::new()
            .name("cancel-timer".into())
            .spawn(move || {
                std::thread::sleep(after);
                timer.cancel();
            });
        if let Err(e) = spawned {
            log::warn!("failed to spawn cancel timer ({e}), cancelling immediately");
            token.cancel();
        }
        token
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the token. Returns `true` only for the call that flipped it.
    pub fn cancel(&self) -> bool {
        let mut cancelled = self.state();
        if *cancelled {
            return false;
        }
        *cancelled = true;
        self.inner.cond.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state()
    }

    /// Block until the token is cancelled.
    pub fn wait(&self) {
        let mut cancelled = self.state();
        while !*cancelled {
            cancelled = self
                .inner
                .cond
                .wait(cancelled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until cancelled or `timeout` elapses. Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.state();
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = self
                .inner
                .cond
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
