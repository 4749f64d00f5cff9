//! Bounded retry with exponential backoff for relay calls
//!
//! Every relay round trip is wrapped in a timeout; a timeout or transport
//! failure is retriable, anything else propagates immediately. Exhausting the
//! attempt budget surfaces the last transport error as a delivery failure.

use std::future::Future;

use tracing::{debug, warn};

use passby_core::errors::{PassbyError, RelayError, Result};
use passby_core::RetryPolicy;

/// Run `attempt_fn` under `policy`, retrying retriable failures.
pub async fn call<T, F, Fut>(policy: &RetryPolicy, op: &'static str, mut attempt_fn: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let error = match tokio::time::timeout(policy.call_timeout, attempt_fn()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) if error.is_retriable() => error,
            Ok(Err(error)) => return Err(error),
            // A timed-out call is a failed call, never a success
            Err(_) => PassbyError::Relay(RelayError::Timeout {
                duration_ms: policy.call_timeout.as_millis() as u64,
            }),
        };

        if attempt >= policy.max_attempts {
            warn!(op, attempts = attempt, %error, "relay operation failed after bounded retries");
            return Err(error);
        }

        let delay = policy.delay_after(attempt);
        debug!(op, attempt, delay_ms = delay.as_millis() as u64, %error, "retrying relay operation");
        tokio::time::sleep(delay).await;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
