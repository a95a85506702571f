//! Bounded retry with exponential backoff for transient store failures.

use std::time::Duration;

use tracing::warn;

use crate::error::EngineResult;

/// How often and how patiently to retry a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op`, retrying only while it fails with a transient error.
///
/// Callers must only pass idempotent operations.
pub fn retry_transient<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> EngineResult<T>,
) -> EngineResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, ?delay, error = %err, "transient failure, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use keel_state::StateError;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let mut calls = 0;
        let result = retry_transient(&fast(), || {
            calls += 1;
            if calls < 3 {
                Err(EngineError::Store(StateError::Timeout(Duration::from_millis(1))))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_attempts() {
        let mut calls = 0;
        let result: EngineResult<()> = retry_transient(&fast(), || {
            calls += 1;
            Err(EngineError::Store(StateError::Timeout(Duration::from_millis(1))))
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }

    #[test]
    fn definitive_rejections_are_not_retried() {
        let mut calls = 0;
        let result: EngineResult<()> = retry_transient(&fast(), || {
            calls += 1;
            Err(EngineError::Conflict("binding exists".into()))
        });
        assert!(matches!(result, Err(EngineError::Conflict(_))));
        assert_eq!(calls, 1);
    }
}
