//! Send retry with exponential backoff.

use crate::change_stream::ChangeStreamClient;
use crate::config::RetryPolicy;
use crate::error::RealtimeError;
use crate::record::Record;
use crate::scope::Scope;
use log::{debug, error, warn};
use tokio::time::{Duration, sleep};

/// Calculates the retry delay using exponential backoff with jitter.
///
/// The delay doubles with each attempt, starting from `initial_delay`, and is capped at
/// `max_delay`. A ±10% random jitter spreads out retries of clients that failed together.
pub(crate) fn calculate_retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    calculate_retry_delay_with_jitter(policy, attempt, true)
}

fn calculate_retry_delay_with_jitter(policy: &RetryPolicy, attempt: u32, apply_jitter: bool) -> Duration {
    use rand::Rng;

    let initial_ms = policy.initial_delay.as_millis() as u64;
    let max_ms = policy.max_delay.as_millis() as u64;

    // Cap attempt at 63 to prevent 2^attempt from overflowing u64
    let capped_attempt = attempt.min(63);
    let multiplier = 2u64.saturating_pow(capped_attempt);
    let base_delay_ms = initial_ms.saturating_mul(multiplier).min(max_ms);

    if !apply_jitter || base_delay_ms == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    let jitter_range = (base_delay_ms as f64 * 0.1) as u64;
    if jitter_range == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-(jitter_range as i64)..=(jitter_range as i64));
    let final_delay_ms = (base_delay_ms as i64 + jitter).max(1) as u64;

    Duration::from_millis(final_delay_ms.min(max_ms))
}

#[cfg(test)]
pub(crate) fn calculate_retry_delay_no_jitter(policy: &RetryPolicy, attempt: u32) -> Duration {
    calculate_retry_delay_with_jitter(policy, attempt, false)
}

/// Sends `record`, retrying transport errors with backoff.
///
/// An explicit rejection (`Ok(false)`) is final and not retried. Returns
/// [`RealtimeError::SendFailure`] once the policy's attempts are used up.
pub(crate) async fn send_with_retry(
    client: &dyn ChangeStreamClient,
    scope: &Scope,
    record: &Record,
    policy: &RetryPolicy,
) -> Result<(), RealtimeError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error: Option<String> = None;

    for attempt in 0..attempts {
        match client.send(scope, record.clone()).await {
            Ok(true) => {
                debug!(
                    "Sent {} to '{}'{}",
                    record.kind_name(),
                    scope,
                    if attempt > 0 {
                        format!(" (after {} retries)", attempt)
                    } else {
                        String::new()
                    }
                );
                return Ok(());
            }
            Ok(false) => {
                warn!("Send of {} to '{}' was rejected", record.kind_name(), scope);
                return Err(RealtimeError::SendFailure(
                    "rejected by the server".to_string(),
                ));
            }
            Err(e) => {
                last_error = Some(e.to_string());
                if attempt + 1 < attempts {
                    let delay = calculate_retry_delay(policy, attempt);
                    warn!(
                        "Failed sending {} to '{}' (attempt {}/{}): {}. Retrying in {:?}",
                        record.kind_name(),
                        scope,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                } else {
                    error!(
                        "Failed sending {} to '{}' after {} attempts: {}",
                        record.kind_name(),
                        scope,
                        attempts,
                        e
                    );
                }
            }
        }
    }

    Err(RealtimeError::SendFailure(
        last_error.unwrap_or_else(|| "unknown error".to_string()),
    ))
}
