//! End-to-end tests for HttpServer driven through the adapters

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use graceful_core::{
    Body, Bytes, CancelToken, CoordinateError, HttpServer, Request, Response, ServeError,
    run_until_cancelled, run_until_cancelled_tls,
};

type RunResult = Result<(), CoordinateError<ServeError, ServeError>>;

fn text(body: impl Into<String>) -> Response<Body> {
    Response::new(Body::from(body.into()))
}

fn spawn_server(
    server: &Arc<HttpServer>,
    cancel: &CancelToken,
    timeout: Duration,
) -> JoinHandle<RunResult> {
    let server = server.clone();
    let cancel = cancel.clone();
    thread::spawn(move || run_until_cancelled(server, &cancel, timeout))
}

/// Raw HTTP/1.1 exchange on a fresh connection; returns whatever the server sent.
fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).expect("Failed to connect");
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    // A forced close may reset the connection; keep what was read
    let _ = stream.read_to_end(&mut response);
    String::from_utf8_lossy(&response).into_owned()
}

fn get(addr: SocketAddr, path: &str) -> String {
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    exchange(addr, request.as_bytes())
}

fn wait_for_active(server: &HttpServer, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.active_requests() != count {
        assert!(Instant::now() < deadline, "request never became active");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn serves_until_cancelled() {
    let server = Arc::new(HttpServer::new("127.0.0.1:0", |req: Request<Bytes>| {
        text(format!("hello {}", req.uri().path()))
    }));
    let cancel = CancelToken::new();
    let runner = spawn_server(&server, &cancel, Duration::from_secs(5));

    let addr = server
        .wait_ready(Duration::from_secs(5))
        .expect("server did not start");
    let response = get(addr, "/world");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("hello /world"));

    cancel.cancel();
    let res = runner.join().unwrap();
    assert!(res.is_ok(), "unexpected: {res:?}");
    assert!(server.local_addr().is_none());
}

#[test]
fn malformed_request_gets_400() {
    let server = Arc::new(HttpServer::new("127.0.0.1:0", |_| text("unused")));
    let cancel = CancelToken::new();
    let runner = spawn_server(&server, &cancel, Duration::from_secs(5));
    let addr = server.wait_ready(Duration::from_secs(5)).unwrap();

    let response = exchange(addr, b"nonsense\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");

    cancel.cancel();
    assert!(runner.join().unwrap().is_ok());
}

#[test]
fn unread_request_bodies_still_get_responses() {
    // The handler never looks at the body; every upload must still be answered
    let server = Arc::new(HttpServer::new("127.0.0.1:0", |_| text("ok")));
    let cancel = CancelToken::new();
    let runner = spawn_server(&server, &cancel, Duration::from_secs(5));
    let addr = server.wait_ready(Duration::from_secs(5)).unwrap();

    let body = vec![b'x'; 256 * 1024];
    for _ in 0..20 {
        let mut request = format!(
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(&body);

        let response = exchange(addr, &request);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response:?}");
        assert!(response.ends_with("ok"));
    }

    cancel.cancel();
    assert!(runner.join().unwrap().is_ok());
}

#[test]
fn handler_sees_request_body() {
    let server = Arc::new(HttpServer::new("127.0.0.1:0", |req: Request<Bytes>| {
        text(format!("{} bytes", req.body().len()))
    }));
    let cancel = CancelToken::new();
    let runner = spawn_server(&server, &cancel, Duration::from_secs(5));
    let addr = server.wait_ready(Duration::from_secs(5)).unwrap();

    let response = exchange(
        addr,
        b"POST / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 5\r\n\r\nhello",
    );
    assert!(response.ends_with("5 bytes"), "{response}");

    cancel.cancel();
    assert!(runner.join().unwrap().is_ok());
}

#[test]
fn drains_in_flight_request() {
    let server = Arc::new(HttpServer::new("127.0.0.1:0", |_| {
        thread::sleep(Duration::from_millis(100));
        text("done")
    }));
    let cancel = CancelToken::new();
    let runner = spawn_server(&server, &cancel, Duration::from_secs(5));
    let addr = server.wait_ready(Duration::from_secs(5)).unwrap();

    let client = thread::spawn(move || get(addr, "/slow"));
    wait_for_active(&server, 1);
    cancel.cancel();

    let res = runner.join().unwrap();
    assert!(res.is_ok(), "unexpected: {res:?}");
    assert!(client.join().unwrap().ends_with("done"));
}

#[test]
fn slow_request_exceeds_shutdown_deadline() {
    let server = Arc::new(HttpServer::new("127.0.0.1:0", |_| {
        thread::sleep(Duration::from_secs(3));
        text("late")
    }));
    let cancel = CancelToken::new();
    let runner = spawn_server(&server, &cancel, Duration::from_millis(200));
    let addr = server.wait_ready(Duration::from_secs(5)).unwrap();

    let client = thread::spawn(move || get(addr, "/"));
    wait_for_active(&server, 1);
    let cancelled = Instant::now();
    cancel.cancel();

    let err = runner.join().unwrap().unwrap_err();
    assert_eq!(err.shutdown_error(), Some(&ServeError::DeadlineExceeded));
    // Past the deadline the connection is dropped rather than waited for
    assert!(cancelled.elapsed() < Duration::from_secs(2));
    assert!(!client.join().unwrap().contains("late"));
}

#[test]
fn stalled_client_cannot_hold_shutdown_past_deadline() {
    let server = Arc::new(
        HttpServer::new("127.0.0.1:0", |_| text("unused")).with_read_timeout(None),
    );
    let cancel = CancelToken::new();
    let runner = spawn_server(&server, &cancel, Duration::from_millis(200));
    let addr = server.wait_ready(Duration::from_secs(5)).unwrap();

    // Half a request head, never completed
    let mut stalled = TcpStream::connect(addr).unwrap();
    stalled.write_all(b"GET / HTTP/1.1\r\nHost: loc").unwrap();
    thread::sleep(Duration::from_millis(50));

    let cancelled = Instant::now();
    cancel.cancel();
    let res = runner.join().unwrap();
    assert!(cancelled.elapsed() < Duration::from_secs(2), "shutdown hung");
    if let Err(err) = res {
        assert_eq!(err.shutdown_error(), Some(&ServeError::DeadlineExceeded));
    }
    assert!(server.local_addr().is_none());
}

#[test]
fn bind_failure_is_start_error() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();
    let server = Arc::new(HttpServer::new(addr.to_string(), |_| text("unused")));
    let cancel = CancelToken::new();

    let err = run_until_cancelled(server, &cancel, Duration::from_millis(50)).unwrap_err();
    assert!(err.is_start());
    assert!(matches!(
        err.start_error(),
        Some(ServeError::Io {
            kind: std::io::ErrorKind::AddrInUse,
            ..
        })
    ));

    // Release the parked shutdown thread
    cancel.cancel();
}

#[test]
fn tls_round_trip() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let server = Arc::new(HttpServer::new("127.0.0.1:0", |_| text("secure")));
    let cancel = CancelToken::new();
    let runner = {
        let server = server.clone();
        let cancel = cancel.clone();
        let (cert_path, key_path) = (cert_path.clone(), key_path.clone());
        thread::spawn(move || {
            run_until_cancelled_tls(server, cert_path, key_path, &cancel, Duration::from_secs(5))
        })
    };
    let addr = server.wait_ready(Duration::from_secs(5)).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(&rustls::Certificate(cert.serialize_der().unwrap()))
        .unwrap();
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = rustls::ServerName::try_from("localhost").unwrap();
    let conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
    let mut tls = rustls::StreamOwned::new(conn, TcpStream::connect(addr).unwrap());

    tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("secure"));

    cancel.cancel();
    let res = runner.join().unwrap();
    assert!(res.is_ok(), "unexpected: {res:?}");
}
