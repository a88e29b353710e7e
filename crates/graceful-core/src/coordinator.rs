//! Shutdown coordination for a single blocking operation.
//!
//! [`coordinate`] runs the blocking `start` call on the caller's thread while
//! one background thread waits for cancellation and then calls `stop` under a
//! fresh deadline. The two outcomes are reconciled into one result.

use std::convert::Infallible;
use std::sync::mpsc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::context::ShutdownContext;

/// Failure of one coordination phase.
///
/// `E` is the blocking operation's outcome type, `F` the stop operation's error type.
#[derive(Debug)]
pub enum CoordinateError<E, F> {
    /// The blocking operation ended with something other than the expected outcome
    Start(E),
    /// The stop operation failed (including an exceeded deadline)
    Shutdown(F),
    /// The shutdown thread could not be spawned; `start` never ran
    Spawn(std::io::Error),
}

impl<E, F> CoordinateError<E, F> {
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start(_))
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown(_))
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn(_))
    }

    pub fn start_error(&self) -> Option<&E> {
        match self {
            Self::Start(e) => Some(e),
            _ => None,
        }
    }

    pub fn shutdown_error(&self) -> Option<&F> {
        match self {
            Self::Shutdown(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: std::fmt::Display, F: std::fmt::Display> std::fmt::Display for CoordinateError<E, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start(e) => write!(f, "error while running: {e}"),
            Self::Shutdown(e) => write!(f, "error on shutdown: {e}"),
            Self::Spawn(e) => write!(f, "failed to spawn shutdown thread: {e}"),
        }
    }
}

impl<E, F> std::error::Error for CoordinateError<E, F>
where
    E: std::error::Error + 'static,
    F: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Start(e) => Some(e),
            Self::Shutdown(e) => Some(e),
            Self::Spawn(e) => Some(e),
        }
    }
}

/// Run `start` until `cancel` fires, then stop it via `stop` within `deadline`.
///
/// - `start` blocks on the calling thread and must return once `stop` asks it
///   to. Returning `expected` means "stopped as requested"; any other outcome
///   is a [`CoordinateError::Start`].
/// - `stop` runs at most once, on a background thread, only after `cancel`
///   has fired. Its context is created at that moment from `deadline`
///   (`Duration::ZERO` = unbounded). An error becomes
///   [`CoordinateError::Shutdown`].
/// - When both phases fail the shutdown error is returned.
///
/// If `start` fails before cancellation, the start error is returned at once
/// and the background thread keeps waiting on `cancel`; callers must resolve
/// the token eventually (e.g. at process exit). If `start` returns `expected`
/// without cancellation ever firing, this call blocks until it does.
///
/// A panic inside `stop` is resumed on the calling thread. Failing to spawn
/// the shutdown thread is reported as [`CoordinateError::Spawn`] before
/// `start` is called.
///
/// May be called from within an async runtime's `block_on`.
pub fn coordinate<E, F, S, T>(
    start: S,
    expected: E,
    stop: T,
    cancel: &CancelToken,
    deadline: Duration,
) -> Result<(), CoordinateError<E, F>>
where
    S: FnOnce() -> Result<Infallible, E>,
    T: FnOnce(&ShutdownContext) -> Result<(), F> + Send + 'static,
    E: PartialEq,
    F: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let watcher = cancel.clone();
    let handle = match std::thread::Builder::new()
        .name("graceful-shutdown".into())
        .spawn(move || {
            watcher.wait();
            log::debug!("cancellation observed, stopping (deadline: {deadline:?})");
            let ctx = ShutdownContext::with_timeout(deadline);
            // Receiver gone means the caller already returned a start error
            let _ = tx.send(stop(&ctx));
        }) {
        Ok(handle) => handle,
        Err(e) => return Err(CoordinateError::Spawn(e)),
    };

    let outcome = match start() {
        Ok(never) => match never {},
        Err(e) => e,
    };

    let start_err = if outcome == expected {
        None
    } else if cancel.is_cancelled() {
        // stop is running (or about to); its error takes precedence
        Some(outcome)
    } else {
        log::debug!("operation failed before cancellation, shutdown thread left waiting");
        return Err(CoordinateError::Start(outcome));
    };

    let stopped = match rx.recv() {
        Ok(stopped) => stopped,
        Err(_) => {
            let payload: Box<dyn std::any::Any + Send> = match handle.join() {
                Err(payload) => payload,
                Ok(()) => Box::new("shutdown thread exited without an outcome"),
            };
            std::panic::resume_unwind(payload);
        }
    };

    if let Err(e) = stopped {
        return Err(CoordinateError::Shutdown(e));
    }
    match start_err {
        Some(e) => Err(CoordinateError::Start(e)),
        None => Ok(()),
    }
}
