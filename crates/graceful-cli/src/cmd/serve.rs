//! Serve subcommand - hello-world HTTP(S) server with graceful shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use graceful_core::{
    Body, Bytes, HttpServer, Request, Response, run_until_cancelled, run_until_cancelled_tls,
};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address
    #[arg(short, long)]
    pub addr: Option<String>,

    /// Artificial handler latency in milliseconds
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Shutdown timeout in seconds, counted from the signal (0 = unbounded)
    #[arg(short, long)]
    pub timeout_secs: Option<u64>,

    /// TLS certificate chain (PEM)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Shut down on our own after this many milliseconds
    #[arg(long)]
    pub run_for_ms: Option<u64>,
}

/// TLS material from flags, falling back to config; both or neither.
fn tls_paths(args: &ServeArgs, config: &Config) -> Result<Option<(PathBuf, PathBuf)>> {
    let cert = args
        .cert
        .clone()
        .or_else(|| config.server.cert.as_ref().map(PathBuf::from));
    let key = args
        .key
        .clone()
        .or_else(|| config.server.key.as_ref().map(PathBuf::from));
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some((cert, key))),
        (None, None) => Ok(None),
        (Some(_), None) => bail!("TLS certificate given without a key"),
        (None, Some(_)) => bail!("TLS key given without a certificate"),
    }
}

fn hello_handler(
    delay: Duration,
) -> impl Fn(Request<Bytes>) -> Response<Body> + Send + Sync + 'static {
    move |req: Request<Bytes>| {
        log::info!("start {} {}", req.method(), req.uri());
        std::thread::sleep(delay);
        log::info!("finish {} {}", req.method(), req.uri());
        Response::new(Body::from("Hello World"))
    }
}

pub fn run(args: ServeArgs, config: &Config) -> Result<u8> {
    let tls = tls_paths(&args, config)?;
    let addr = args.addr.unwrap_or_else(|| config.server.addr.clone());
    let delay = Duration::from_millis(args.delay_ms.unwrap_or(config.server.delay_ms));
    let timeout = args
        .timeout_secs
        .map_or_else(|| config.shutdown_timeout(), Duration::from_secs);

    let run_for = args.run_for_ms.map(Duration::from_millis);
    let cancel = super::cancellation(&config.shutdown, run_for)?;
    let server = Arc::new(
        HttpServer::new(addr, hello_handler(delay)).with_read_timeout(config.server.read_timeout()),
    );

    log::debug!("shutdown timeout: {timeout:?}, handler delay: {delay:?}");
    let res = match tls {
        Some((cert, key)) => run_until_cancelled_tls(server, cert, key, &cancel, timeout),
        None => run_until_cancelled(server, &cancel, timeout),
    };
    Ok(super::report(res))
}
