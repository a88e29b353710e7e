//! Graceful Core - Shutdown coordination for long-running blocking operations
//!
//! This crate runs a blocking operation (typically a server's accept loop)
//! until a one-shot cancellation fires, then stops it under a deadline and
//! reconciles both outcomes into a single result.

pub mod adapter;
pub mod cancel;
pub mod context;
pub mod coordinator;
pub mod http;
pub mod logging;
pub mod signal;

// Re-exports for convenience
pub use adapter::{Server, TlsServer, run_until_cancelled, run_until_cancelled_tls};
pub use cancel::CancelToken;
pub use context::{DeadlineExceeded, ShutdownContext};
pub use coordinator::{CoordinateError, coordinate};
pub use http::{Body, Bytes, HttpServer, Request, Response, ServeError, StatusCode};
pub use logging::init_logging;
pub use signal::{SignalOptions, notify_shutdown, notify_shutdown_with};
