//! Subcommands and the plumbing they share

pub mod fib;
pub mod serve;

use std::time::Duration;

use anyhow::{Context, Result};
use graceful_core::{CancelToken, CoordinateError, SignalOptions, notify_shutdown_with};

use crate::config::ShutdownConfig;

/// Exit status for a graceful stop
pub const EXIT_OK: u8 = 0;
/// Exit status when the operation failed on its own
pub const EXIT_START_FAILED: u8 = 1;
/// Exit status when shutdown failed, or for setup errors
pub const EXIT_SHUTDOWN_FAILED: u8 = 2;

/// Token cancelled by SIGINT/SIGTERM, or after `run_for` if given.
pub fn cancellation(config: &ShutdownConfig, run_for: Option<Duration>) -> Result<CancelToken> {
    let token = notify_shutdown_with(SignalOptions {
        force_exit_on_repeat: config.force_exit_on_repeat,
    })
    .context("Failed to install signal handlers")?;

    if let Some(after) = run_for {
        let timer = token.clone();
        std::thread::Builder::new()
            .name("run-for".into())
            .spawn(move || {
                if !timer.wait_timeout(after) {
                    log::info!("Run time of {after:?} elapsed, shutting down");
                    timer.cancel();
                }
            })
            .context("Failed to spawn run-for timer")?;
    }
    Ok(token)
}

/// Log the outcome of a coordinated run and map it to an exit status.
pub fn report<E, F>(res: Result<(), CoordinateError<E, F>>) -> u8
where
    E: std::fmt::Display,
    F: std::fmt::Display,
{
    match res {
        Ok(()) => {
            log::info!("gracefully shut down");
            EXIT_OK
        }
        Err(e) => {
            log::error!("{e}");
            if e.is_start() {
                EXIT_START_FAILED
            } else {
                EXIT_SHUTDOWN_FAILED
            }
        }
    }
}
