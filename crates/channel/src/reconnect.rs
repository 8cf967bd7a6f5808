//! Exponential-backoff connection logic for the broker.
//!
//! [`connect_with_backoff`] keeps calling a connect function with increasing
//! delays until it succeeds, the attempt ceiling is reached, or the
//! [`CancellationToken`] is triggered. At startup the planner uses a bounded
//! ceiling: running without a broker is not an option.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Give up after this many attempts. `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Call `connect` until it succeeds, backing off between failures.
///
/// Returns the last connect error once `max_attempts` is exhausted, or
/// [`ChannelError::Closed`] if `cancel` fires first.
pub async fn connect_with_backoff<T, F, Fut>(
    mut connect: F,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<T, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Broker connect cancelled");
                return Err(ChannelError::Closed);
            }
            result = connect() => result,
        };

        match result {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Connected to broker after retrying");
                }
                return Ok(conn);
            }
            Err(e) => {
                // Configuration problems do not heal with time.
                if matches!(e, ChannelError::Unsupported(_)) {
                    return Err(e);
                }
                if config.max_attempts.is_some_and(|max| attempt >= max) {
                    tracing::error!(attempt, error = %e, "Giving up on broker connection");
                    return Err(e);
                }
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Broker connect attempt {attempt} failed",
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Closed),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
