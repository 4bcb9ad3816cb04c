//! Bounded retry for optimistic writes.

use std::time::Duration;

use tracing::debug;

use crate::error::{RegistryError, RegistryResult};

/// Default number of attempts before a conflicting write gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry; doubles on each further retry.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

/// Outcome of one optimistic attempt.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    /// The write committed.
    Done(T),
    /// Someone else wrote first; re-read and try again.
    Conflict,
}

/// How many times to retry a conflicting write, and how long to wait between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first included.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }

    /// Run `op` until it commits, fails, or the attempts run out.
    ///
    /// Exhaustion surfaces as [`RegistryError::Contention`].
    pub(crate) fn run<T>(
        &self,
        operation: &'static str,
        node_id: &str,
        mut op: impl FnMut() -> RegistryResult<Attempt<T>>,
    ) -> RegistryResult<T> {
        for attempt in 1..=self.max_attempts {
            match op()? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Conflict => {
                    debug!(operation, node_id, attempt, "Write conflict, retrying");
                    if attempt < self.max_attempts {
                        std::thread::sleep(self.delay_for(attempt));
                    }
                }
            }
        }

        Err(RegistryError::Contention {
            operation,
            node_id: node_id.to_string(),
            attempts: self.max_attempts,
        })
    }
}
