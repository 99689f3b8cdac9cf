//! Bounded retry with an overall deadline.

use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Attempts, inter-attempt sleep and overall budget for a flaky call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub sleep: Duration,
    pub timeout: Duration,
}

/// Why a retried call gave up.
#[derive(Debug)]
pub struct RetryError {
    pub attempts: u32,
    pub last: anyhow::Error,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, sleep: Duration, timeout: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            sleep,
            timeout,
        }
    }

    /// Run `op` until it succeeds, attempts run out, or the next sleep would
    /// cross the deadline. A call already in flight is never interrupted.
    pub fn run<T, F>(&self, mut op: F) -> std::result::Result<T, RetryError>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let out_of_time = Instant::now() + self.sleep >= deadline;
            if attempt >= self.max_attempts || out_of_time {
                return Err(RetryError {
                    attempts: attempt,
                    last: err,
                });
            }

            debug!(attempt, error = %err, "Retrying after failure");
            thread::sleep(self.sleep);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(15))
    }
}
