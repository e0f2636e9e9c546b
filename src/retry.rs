//! Retry with exponential backoff over a declared fault set.
//!

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// The default number of attempts.
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// The default initial wait between attempts.
pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_millis(200);

/// The default backoff multiplier.
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// A retry policy applied narrowly at adapter call sites. Only faults the
/// predicate names are retried; everything else propagates immediately.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    attempts: u32,
    initial_wait: Duration,
    backoff_factor: u32,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_wait: DEFAULT_INITIAL_WAIT,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl Retry {
    /// Create a policy with an explicit attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Create a policy with an explicit initial wait.
    pub fn with_initial_wait(mut self, initial_wait: Duration) -> Self {
        self.initial_wait = initial_wait;
        self
    }

    /// Run the operation, retrying on faults matched by `retryable`.
    pub async fn run<T, F, Fut, P>(&self, retryable: P, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut wait = self.initial_wait;
        let mut tries_remaining = self.attempts;

        loop {
            tries_remaining -= 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if tries_remaining > 0 && retryable(&err) => {
                    sleep(wait).await;
                    wait *= self.backoff_factor;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The fault set for transient cloud errors.
pub fn transient(err: &Error) -> bool {
    err.is_transient()
}

/// The fault set for tag writes, where not-found can appear transiently
/// right after object creation.
pub fn transient_or_not_found(err: &Error) -> bool {
    err.is_transient() || matches!(err, Error::BlobNotFound(_))
}
