//! Fib subcommand - interruptible Fibonacci calculation
//!
//! Shows coordination of a non-server workload: the calculation polls a
//! stop flag between terms and reports `FibError::Interrupted` when set.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use graceful_core::coordinate;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct FibArgs {
    /// Pause per addition in milliseconds
    #[arg(long)]
    pub step_ms: Option<u64>,

    /// Stop on our own after this many milliseconds
    #[arg(long)]
    pub run_for_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibError {
    /// Stopped on request
    Interrupted,
    /// F_index does not fit in u128
    Overflow { index: u32 },
}

impl std::fmt::Display for FibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupted => write!(f, "received interrupt signal"),
            Self::Overflow { index } => write!(f, "F_{index} overflowed u128"),
        }
    }
}

impl std::error::Error for FibError {}

/// F_n computed by n additions, each preceded by `step` of sleep.
fn fib(n: u32, step: Duration) -> Option<u128> {
    let (mut f1, mut f2) = (1u128, 0u128);
    for _ in 0..n {
        if !step.is_zero() {
            std::thread::sleep(step);
        }
        (f1, f2) = (f2, f1.checked_add(f2)?);
    }
    Some(f2)
}

/// Prints successive Fibonacci numbers until stopped.
pub struct FibCalc {
    step: Duration,
    stopped: AtomicBool,
}

impl FibCalc {
    pub fn new(step: Duration) -> Self {
        Self {
            step,
            stopped: AtomicBool::new(false),
        }
    }

    /// Blocks until [`stop`](Self::stop) is observed or the sequence overflows.
    pub fn begin(&self) -> Result<Infallible, FibError> {
        let mut i = 1u32;
        loop {
            let value = fib(i, self.step).ok_or(FibError::Overflow { index: i })?;
            log::info!("F_{i}: {value}");
            if self.stopped.load(Ordering::Relaxed) {
                return Err(FibError::Interrupted);
            }
            i += 1;
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

pub fn run(args: FibArgs, config: &Config) -> Result<u8> {
    let step = Duration::from_millis(args.step_ms.unwrap_or(config.fib.step_ms));
    let cancel = super::cancellation(
        &config.shutdown,
        args.run_for_ms.map(Duration::from_millis),
    )?;

    let calc = Arc::new(FibCalc::new(step));
    let stopper = calc.clone();

    // stop ignores its context, so no deadline is needed
    let res = coordinate(
        || calc.begin(),
        FibError::Interrupted,
        move |_| {
            stopper.stop();
            Ok::<(), Infallible>(())
        },
        &cancel,
        Duration::ZERO,
    );
    Ok(super::report(res))
}
