//! Exponential backoff with jitter.
//!
//! [`Backoff`] hands out successive delays and is used directly by long-lived
//! loops such as the MQTT event loop, which reconnects forever.
//! [`retry_with_backoff`] wraps a fallible async operation for one-shot
//! callers like the CLI.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff policy for operations that fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay (before jitter)
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Policy bounded to `attempts` tries.
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Start a fresh backoff sequence for this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            attempt: 0,
            delay: self.initial_delay,
        }
    }
}

/// Stateful delay generator.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the policy allows another attempt.
    pub fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts
    }

    /// Next delay, jittered to 0.5x..1.5x of the nominal value.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        jittered
    }

    /// Return to the initial delay after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay;
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// Returns the last error when `max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = config.backoff();

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                // Count this failure before checking the budget
                let delay = backoff.next_delay();
                if backoff.exhausted() {
                    error!(
                        operation = %operation_name,
                        attempt = backoff.attempt(),
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = backoff.attempt(),
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
