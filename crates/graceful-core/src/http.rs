//! Blocking facade over a hyper HTTP/1.1 server with graceful shutdown.
//!
//! [`HttpServer::serve`] drives hyper on a private tokio runtime and blocks
//! the calling thread until the server is shut down. [`HttpServer::shutdown`]
//! closes the listener, lets in-flight requests finish and, once the
//! [`ShutdownContext`] expires, drops whatever is left so `serve` returns.

use std::convert::Infallible;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::{StreamExt, future};
use hyper::server::accept::{self, Accept};
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

pub use hyper::body::Bytes;
pub use hyper::{Body, Request, Response, StatusCode};

use crate::adapter::{Server, TlsServer};
use crate::context::{DeadlineExceeded, ShutdownContext};

/// Default timeout for reading a request head
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS handshakes in progress at once per listener
const TLS_HANDSHAKES: usize = 64;

/// Worker threads of each server's runtime
const WORKER_THREADS: usize = 2;

/// Error types for serve and shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeError {
    /// Server stopped because shutdown was requested
    Closed,
    /// I/O error (bind, runtime, certificate files, server failure)
    Io {
        kind: io::ErrorKind,
        message: String,
    },
    /// TLS configuration error
    Tls(String),
    /// Requests were still in flight when the shutdown deadline passed
    DeadlineExceeded,
}

impl std::fmt::Display for ServeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("server closed"),
            Self::Io { message, .. } => write!(f, "IO error: {message}"),
            Self::Tls(message) => write!(f, "TLS: {message}"),
            Self::DeadlineExceeded => write!(f, "{}", DeadlineExceeded),
        }
    }
}

impl std::error::Error for ServeError {}

impl From<io::Error> for ServeError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<hyper::Error> for ServeError {
    fn from(e: hyper::Error) -> Self {
        Self::Io {
            kind: io::ErrorKind::Other,
            message: format!("http server: {e}"),
        }
    }
}

impl From<DeadlineExceeded> for ServeError {
    fn from(_: DeadlineExceeded) -> Self {
        Self::DeadlineExceeded
    }
}

/// Request handler. Runs on tokio's blocking pool with the body fully read.
type Handler = dyn Fn(Request<Bytes>) -> Response<Body> + Send + Sync;

#[derive(Default)]
struct State {
    /// Shutdown requested; `serve` must not start
    closing: bool,
    /// Bound address while `serve` runs
    listening: Option<SocketAddr>,
    /// Requests being handled
    active: usize,
    /// Closes the listener and lets open connections finish
    graceful: Option<oneshot::Sender<()>>,
    /// Drops every open connection
    force: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts one active request; releases it on drop.
struct ActiveGuard(Arc<Shared>);

impl ActiveGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.lock().active += 1;
        Self(shared)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.active -= 1;
        self.0.cond.notify_all();
    }
}

/// What every connection's service needs
struct App {
    handler: Arc<Handler>,
    shared: Arc<Shared>,
}

/// HTTP server usable with [`run_until_cancelled`](crate::run_until_cancelled)
/// and [`run_until_cancelled_tls`](crate::run_until_cancelled_tls).
///
/// `serve` blocks on its own runtime, so it must not be called from inside
/// another tokio runtime.
pub struct HttpServer {
    addr: String,
    handler: Arc<Handler>,
    header_timeout: Option<Duration>,
    shared: Arc<Shared>,
}

impl HttpServer {
    pub fn new(
        addr: impl Into<String>,
        handler: impl Fn(Request<Bytes>) -> Response<Body> + Send + Sync + 'static,
    ) -> Self {
        Self {
            addr: addr.into(),
            handler: Arc::new(handler),
            header_timeout: Some(HEADER_READ_TIMEOUT),
            shared: Arc::default(),
        }
    }

    /// Timeout for reading a request head (`None` = wait forever)
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Bound address, if the server is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().listening
    }

    /// Block until the server is listening, up to `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> Option<SocketAddr> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(addr) = state.listening {
                return Some(addr);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn active_requests(&self) -> usize {
        self.shared.lock().active
    }

    fn run(&self, tls: Option<TlsAcceptor>) -> Result<Infallible, ServeError> {
        let (graceful_tx, graceful_rx) = oneshot::channel();
        let (force_tx, force_rx) = oneshot::channel();

        let listener = {
            let mut state = self.shared.lock();
            if state.closing {
                return Err(ServeError::Closed);
            }
            let listener = std::net::TcpListener::bind(&self.addr).map_err(|e| ServeError::Io {
                kind: e.kind(),
                message: format!("bind {}: {e}", self.addr),
            })?;
            listener.set_nonblocking(true)?;
            let addr = listener.local_addr()?;
            state.listening = Some(addr);
            state.graceful = Some(graceful_tx);
            state.force = Some(force_tx);
            self.shared.cond.notify_all();
            log::info!(
                "Listening on {}://{addr}",
                if tls.is_some() { "https" } else { "http" }
            );
            listener
        };

        let err = self.drive(listener, tls, graceful_rx, force_rx);

        let mut state = self.shared.lock();
        state.listening = None;
        state.graceful = None;
        state.force = None;
        self.shared.cond.notify_all();
        Err(err)
    }

    /// Run hyper on a private runtime until it has drained or is forced closed.
    fn drive(
        &self,
        listener: std::net::TcpListener,
        tls: Option<TlsAcceptor>,
        graceful_rx: oneshot::Receiver<()>,
        force_rx: oneshot::Receiver<()>,
    ) -> ServeError {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("http-worker")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return e.into(),
        };

        let app = Arc::new(App {
            handler: self.handler.clone(),
            shared: self.shared.clone(),
        });
        let header_timeout = self.header_timeout;

        let result = runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            let mut incoming = AddrIncoming::from_listener(listener)?;
            incoming.set_nodelay(true);
            // Resource errors such as EMFILE back off for a second instead of ending serve
            incoming.set_sleep_on_errors(true);

            let served = match tls {
                None => serve_incoming(incoming, app, header_timeout, graceful_rx, force_rx).await,
                Some(acceptor) => {
                    let incoming = accept::from_stream(tls_handshakes(incoming, acceptor));
                    serve_incoming(incoming, app, header_timeout, graceful_rx, force_rx).await
                }
            };
            served.map_err(ServeError::from)
        });

        // Drops connection tasks still alive after a forced close
        runtime.shutdown_background();
        match result {
            Ok(()) => ServeError::Closed,
            Err(e) => e,
        }
    }
}

/// Serve until the graceful signal has drained every connection, or until forced.
async fn serve_incoming<I>(
    incoming: I,
    app: Arc<App>,
    header_timeout: Option<Duration>,
    graceful_rx: oneshot::Receiver<()>,
    force_rx: oneshot::Receiver<()>,
) -> Result<(), hyper::Error>
where
    I: Accept,
    I::Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    I::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let make_svc = make_service_fn(move |_: &I::Conn| {
        let app = app.clone();
        future::ok::<_, Infallible>(service_fn(move |req| respond(app.clone(), req)))
    });

    let mut builder = hyper::Server::builder(incoming);
    if let Some(timeout) = header_timeout {
        builder = builder.http1_header_read_timeout(timeout);
    }
    let server = builder.serve(make_svc).with_graceful_shutdown(async move {
        let _ = graceful_rx.await;
        log::debug!("listener closed, draining connections");
    });

    tokio::select! {
        res = server => res,
        _ = force_rx => {
            log::debug!("drain abandoned, dropping remaining connections");
            Ok(())
        }
    }
}

/// Read the whole request body, then hand the request to the blocking handler.
async fn respond(app: Arc<App>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let _guard = ActiveGuard::new(app.shared.clone());
    let (parts, body) = req.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(e) => {
            log::debug!("{} {}: failed to read body: {e}", parts.method, parts.uri);
            return Ok(plain(StatusCode::BAD_REQUEST, "unreadable request body\n"));
        }
    };

    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let handler = app.handler.clone();
    let request = Request::from_parts(parts, body);
    let response = match tokio::task::spawn_blocking(move || handler(request)).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("{method} {uri}: handler failed: {e}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
        }
    };
    log::debug!("{method} {uri} -> {}", response.status());
    Ok(response)
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

/// Accepted connections turned into TLS streams; failed handshakes are skipped.
fn tls_handshakes(
    mut incoming: AddrIncoming,
    acceptor: TlsAcceptor,
) -> impl futures_util::Stream<Item = io::Result<TlsStream<AddrStream>>> {
    futures_util::stream::poll_fn(move |cx| Pin::new(&mut incoming).poll_accept(cx))
        .filter_map(|conn| future::ready(conn.ok()))
        .map(move |stream| acceptor.accept(stream))
        .buffer_unordered(TLS_HANDSHAKES)
        .filter_map(|handshake| {
            future::ready(match handshake {
                Ok(stream) => Some(Ok(stream)),
                Err(e) => {
                    log::debug!("TLS handshake failed: {e}");
                    None
                }
            })
        })
}

impl Server for HttpServer {
    fn serve(&self) -> Result<Infallible, ServeError> {
        self.run(None)
    }

    fn shutdown(&self, ctx: &ShutdownContext) -> Result<(), ServeError> {
        drain(&self.shared, ctx)
    }
}

impl TlsServer for HttpServer {
    fn serve_tls(&self, cert: &Path, key: &Path) -> Result<Infallible, ServeError> {
        if self.shared.lock().closing {
            return Err(ServeError::Closed);
        }
        let config = load_tls_config(cert, key)?;
        self.run(Some(TlsAcceptor::from(Arc::new(config))))
    }

    fn shutdown(&self, ctx: &ShutdownContext) -> Result<(), ServeError> {
        drain(&self.shared, ctx)
    }
}

/// Close the listener, then wait for `serve` to return. Past the deadline the
/// remaining connections are dropped and the deadline error is reported.
fn drain(shared: &Shared, ctx: &ShutdownContext) -> Result<(), ServeError> {
    let graceful = {
        let mut state = shared.lock();
        state.closing = true;
        state.graceful.take()
    };
    if let Some(tx) = graceful {
        let _ = tx.send(());
    }

    let mut state = shared.lock();
    while state.listening.is_some() {
        state = match ctx.remaining() {
            None => shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
            Some(left) if left.is_zero() => {
                log::warn!(
                    "shutdown deadline exceeded with {} request(s) in flight",
                    state.active
                );
                if let Some(force) = state.force.take() {
                    let _ = force.send(());
                }
                return Err(ServeError::DeadlineExceeded);
            }
            Some(left) => {
                shared
                    .cond
                    .wait_timeout(state, left)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
    }
    log::debug!("server drained");
    Ok(())
}

fn load_tls_config(cert: &Path, key: &Path) -> Result<rustls::ServerConfig, ServeError> {
    let certs = rustls_pemfile::certs(&mut open_pem(cert)?).map_err(|e| read_error(cert, e))?;
    if certs.is_empty() {
        return Err(ServeError::Tls(format!(
            "no certificates in {}",
            cert.display()
        )));
    }
    let key = load_private_key(key)?;

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs.into_iter().map(rustls::Certificate).collect(), key)
        .map_err(|e| ServeError::Tls(e.to_string()))
}

/// First PKCS#8, RSA or SEC1 key in the file
fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, ServeError> {
    use rustls_pemfile::Item;

    let mut reader = open_pem(path)?;
    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|e| read_error(path, e))? {
            Some(Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key)) => {
                return Ok(rustls::PrivateKey(key));
            }
            Some(_) => continue,
            None => {
                return Err(ServeError::Tls(format!(
                    "no private key in {}",
                    path.display()
                )));
            }
        }
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ServeError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| read_error(path, e))
}

fn read_error(path: &Path, e: io::Error) -> ServeError {
    ServeError::Io {
        kind: e.kind(),
        message: format!("{}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused(_: Request<Bytes>) -> Response<Body> {
        Response::new(Body::from("unused"))
    }

    #[test]
    fn serve_error_from_io_keeps_kind() {
        let err = ServeError::from(io::Error::new(io::ErrorKind::AddrInUse, "taken"));
        assert!(matches!(
            err,
            ServeError::Io {
                kind: io::ErrorKind::AddrInUse,
                ..
            }
        ));
        assert_eq!(err.to_string(), "IO error: taken");
    }

    #[test]
    fn plain_response_sets_status() {
        let response = plain(StatusCode::BAD_REQUEST, "nope\n");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn shutdown_before_serve_closes_immediately() {
        let server = HttpServer::new("127.0.0.1:0", unused);
        let ctx = ShutdownContext::with_timeout(Duration::from_millis(50));
        assert_eq!(Server::shutdown(&server, &ctx), Ok(()));
        assert_eq!(server.serve().unwrap_err(), ServeError::Closed);
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn shutdown_waits_for_serve_to_return() {
        let server = Arc::new(HttpServer::new("127.0.0.1:0", unused));
        let serving = {
            let server = server.clone();
            std::thread::spawn(move || server.serve())
        };
        server.wait_ready(Duration::from_secs(5)).unwrap();

        let ctx = ShutdownContext::with_timeout(Duration::from_secs(5));
        assert_eq!(Server::shutdown(&*server, &ctx), Ok(()));
        assert!(server.local_addr().is_none());
        assert_eq!(serving.join().unwrap().unwrap_err(), ServeError::Closed);
    }

    #[test]
    fn missing_certificate_is_io_error() {
        let server = HttpServer::new("127.0.0.1:0", unused);
        let err = server
            .serve_tls(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert!(matches!(
            err,
            ServeError::Io {
                kind: io::ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn empty_certificate_file_is_tls_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "").unwrap();
        let err = load_tls_config(&cert, &cert).unwrap_err();
        assert!(matches!(err, ServeError::Tls(ref m) if m.contains("no certificates")));
    }
}
