//! Bindings from server-like resources onto [`coordinate`]

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::context::ShutdownContext;
use crate::coordinator::{CoordinateError, coordinate};
use crate::http::ServeError;

/// A plain blocking server.
///
/// `serve` returns [`ServeError::Closed`] once `shutdown` has been called.
pub trait Server {
    fn serve(&self) -> Result<Infallible, ServeError>;
    fn shutdown(&self, ctx: &ShutdownContext) -> Result<(), ServeError>;
}

/// A blocking server that terminates TLS from certificate and key files.
pub trait TlsServer {
    fn serve_tls(&self, cert: &Path, key: &Path) -> Result<Infallible, ServeError>;
    fn shutdown(&self, ctx: &ShutdownContext) -> Result<(), ServeError>;
}

/// Serve until `cancel` fires, then shut down within `timeout`.
///
/// Blocks the calling thread, so cleanup can run after it returns.
pub fn run_until_cancelled<S>(
    server: Arc<S>,
    cancel: &CancelToken,
    timeout: Duration,
) -> Result<(), CoordinateError<ServeError, ServeError>>
where
    S: Server + Send + Sync + 'static,
{
    let stopper = server.clone();
    coordinate(
        || server.serve(),
        ServeError::Closed,
        move |ctx| stopper.shutdown(ctx),
        cancel,
        timeout,
    )
}

/// TLS variant of [`run_until_cancelled`].
pub fn run_until_cancelled_tls<S>(
    server: Arc<S>,
    cert: impl Into<PathBuf>,
    key: impl Into<PathBuf>,
    cancel: &CancelToken,
    timeout: Duration,
) -> Result<(), CoordinateError<ServeError, ServeError>>
where
    S: TlsServer + Send + Sync + 'static,
{
    let (cert, key) = (cert.into(), key.into());
    let stopper = server.clone();
    coordinate(
        || server.serve_tls(&cert, &key),
        ServeError::Closed,
        move |ctx| stopper.shutdown(ctx),
        cancel,
        timeout,
    )
}
