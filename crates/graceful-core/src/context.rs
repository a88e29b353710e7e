//! Deadline-bound context handed to shutdown operations

use std::time::{Duration, Instant};

/// The shutdown deadline elapsed before the stop operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded;

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown deadline exceeded")
    }
}

impl std::error::Error for DeadlineExceeded {}

/// Bound on a single shutdown attempt.
///
/// Created at the moment cancellation is observed, independent of the
/// cancellation source itself. A zero timeout yields an unbounded context.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownContext {
    deadline: Option<Instant>,
}

impl ShutdownContext {
    /// Context expiring `timeout` from now (`Duration::ZERO` = no bound)
    pub fn with_timeout(timeout: Duration) -> Self {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        Self { deadline }
    }

    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before expiry; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Some(DeadlineExceeded)` once the deadline has passed
    pub fn err(&self) -> Option<DeadlineExceeded> {
        self.is_expired().then_some(DeadlineExceeded)
    }

    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
