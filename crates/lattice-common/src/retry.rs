//! Bounded retry with a fixed delay between attempts.
//!
//! Every loop that waits on the control plane (start-event watch, status
//! polling) runs under a [`RetryBudget`]: a hard cap on attempts, a fixed
//! sleep between them, and a timeout on each individual attempt. The cap is
//! mandatory because the control plane may never emit what we are waiting for
//! (an image that fails to pull never reports a started container).
//!
//! # Example
//!
//! ```ignore
//! use lattice_common::retry::{retry_fixed, RetryBudget};
//!
//! let status = retry_fixed(&RetryBudget::default(), "poll_status", |_attempt| async {
//!     control_plane.get_job_status(namespace, name).await
//! })
//! .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Default maximum number of attempts for control plane waits
pub const MAX_RETRIES: u32 = 100;
/// Default fixed sleep between attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(3);
/// Default bound on a single attempt
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for one operation. Recreated per operation, never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    /// Maximum number of attempts (at least one attempt always runs)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
    /// Upper bound on a single attempt
    pub request_timeout: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            delay: RETRY_DELAY,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

impl RetryBudget {
    /// Create a budget with explicit values
    pub fn new(max_attempts: u32, delay: Duration, request_timeout: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            request_timeout,
        }
    }

    /// A zero-delay budget, used by tests to exercise exhaustion quickly
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Returned when every attempt in a budget failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exhausted {
    /// Number of attempts made
    pub attempts: u32,
    /// Description of the final failure, if any attempt produced one
    pub last_error: Option<String>,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_error {
            Some(e) => write!(f, "gave up after {} attempts: {}", self.attempts, e),
            None => write!(f, "gave up after {} attempts", self.attempts),
        }
    }
}

/// Execute an async operation until it succeeds or the budget runs out.
///
/// The closure receives the 1-based attempt number. Each attempt is bounded by
/// `request_timeout`; a timed-out attempt counts as a failure. Failures are
/// logged at every attempt and only escalate once the budget is exhausted.
pub async fn retry_fixed<F, Fut, T, E>(
    budget: &RetryBudget,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = budget.attempts();
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let failure = match tokio::time::timeout(budget.request_timeout, operation(attempt)).await
        {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "attempt timed out after {}ms",
                budget.request_timeout.as_millis()
            ),
        };

        if attempt < max_attempts {
            warn!(
                operation = %operation_name,
                attempt = attempt,
                max_attempts = max_attempts,
                error = %failure,
                delay_ms = budget.delay.as_millis(),
                "Operation failed, retrying"
            );
            last_error = Some(failure);
            tokio::time::sleep(budget.delay).await;
        } else {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %failure,
                "Operation failed after max retries"
            );
            last_error = Some(failure);
        }
    }

    Err(Exhausted {
        attempts: max_attempts,
        last_error,
    })
}
