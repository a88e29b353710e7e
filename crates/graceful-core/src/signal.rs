//! OS signal wiring for the cancellation token

use std::ffi::c_int;
use std::io;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::cancel::CancelToken;

/// Behaviour on signals after the first one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalOptions {
    /// Exit the process with status 130 on a repeated SIGINT/SIGTERM
    pub force_exit_on_repeat: bool,
}

/// Token cancelled on the first SIGINT or SIGTERM.
pub fn notify_shutdown() -> io::Result<CancelToken> {
    notify_shutdown_with(SignalOptions::default())
}

/// Like [`notify_shutdown`], with control over repeated signals.
///
/// The handlers stay installed for the life of the process, so SIGINT no
/// longer terminates it by default.
pub fn notify_shutdown_with(options: SignalOptions) -> io::Result<CancelToken> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let token = CancelToken::new();
    let notify = token.clone();

    std::thread::Builder::new()
        .name("signal-listener".into())
        .spawn(move || {
            for sig in signals.forever() {
                let name = signal_name(sig);
                if notify.cancel() {
                    log::info!("Received {name}, shutting down gracefully");
                } else if options.force_exit_on_repeat {
                    log::warn!("Received {name} again, forcing exit");
                    std::process::exit(130);
                } else {
                    log::debug!("Received {name} again, shutdown already in progress");
                }
            }
        })?;

    Ok(token)
}

fn signal_name(sig: c_int) -> &'static str {
    match sig {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "signal",
    }
}
