use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::messaging::errors::MessagingResult;

/// Delay before retry number `attempt` (1-based), before jitter
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31) as i32;
    let millis = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = millis.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

fn jittered(config: &RetryConfig, delay: Duration) -> Duration {
    if config.jitter_percent <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = delay.as_millis() as f64 * config.jitter_percent;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((delay.as_millis() as f64 + offset).max(0.0) as u64)
}

/// Run `operation`, retrying transient failures up to `config.max_attempts` times.
///
/// Non-transient errors are returned immediately.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> MessagingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MessagingResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt = attempt, "Store operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = jittered(config, backoff_delay(config, attempt));
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
