//! Backoff policy for SQLite lock contention.
//!
//! Wraps connection acquisition and transaction commits. Only `SQLITE_BUSY`
//! and `SQLITE_LOCKED` are retried; every other failure surfaces at once.

use std::time::Duration;

use lodestone_core::{LodestoneError, RetryConfig};
use rand::Rng;
use rusqlite::ErrorCode;
use tracing::debug;

/// Exponential backoff with uniform jitter.
///
/// The delay before retry `n` (0-based) is
/// `base_delay * multiplier^n + uniform(0, max_jitter)`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use lodestone_retrieval::retry::RetryPolicy;
///
/// let policy = RetryPolicy::new(4, Duration::from_millis(10), 2.0, Duration::ZERO);
/// assert_eq!(policy.delay_for(0), Duration::from_millis(10));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(40));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_jitter: Duration,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: multiplier.max(1.0),
            max_jitter,
        }
    }

    /// Build a policy from the `[store.retry]` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_jitter_ms),
        )
    }

    /// Attempts made before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic part of the delay before retry `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry as i32);
        self.base_delay.mul_f64(factor)
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.delay_for(retry) + Duration::from_millis(jitter)
    }

    /// Run `op`, retrying contention failures with backoff.
    ///
    /// Blocks the calling thread while sleeping, so call it from store code
    /// that already runs off the async executor.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::StorageBusy`] once the attempt budget is
    /// spent, or [`LodestoneError::Database`] for any non-contention failure.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, LodestoneError>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        for attempt in 1..=self.max_attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_contention(&e) => {
                    if attempt == self.max_attempts {
                        break;
                    }
                    let delay = self.jittered_delay(attempt - 1);
                    debug!(what, attempt, delay_ms = delay.as_millis() as u64, "store busy, backing off");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(LodestoneError::Database(format!("{what}: {e}"))),
            }
        }
        Err(LodestoneError::StorageBusy {
            attempts: self.max_attempts,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Returns `true` for lock contention errors worth retrying.
pub fn is_contention(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        )
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), 2.0, Duration::from_millis(1))
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50), 2.0, Duration::ZERO);
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn succeeds_after_transient_contention() {
        let mut calls = 0;
        let result = fast_policy(4).run("test", || {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn exhausted_budget_is_storage_busy() {
        let mut calls = 0;
        let result: Result<(), _> = fast_policy(3).run("test", || {
            calls += 1;
            Err(busy())
        });
        assert_eq!(calls, 3);
        assert!(matches!(result, Err(LodestoneError::StorageBusy { attempts: 3 })));
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = fast_policy(5).run("test", || {
            calls += 1;
            Err(rusqlite::Error::InvalidQuery)
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(LodestoneError::Database(_))));
    }

    #[test]
    fn zero_attempts_clamps_to_one() {
        assert_eq!(fast_policy(0).max_attempts(), 1);
    }
}
