//! Retry with exponential backoff on transient status codes.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{CallError, RemoteResponse};

/// Retry policy for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Status codes that trigger another attempt
    #[serde(default = "default_transient_status_codes")]
    pub transient_status_codes: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_initial_delay() -> u64 {
    3000
}
fn default_max_delay() -> u64 {
    // initial * multiplier^(max_attempts - 1)
    1_536_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_transient_status_codes() -> Vec<u16> {
    vec![403, 429, 500, 502, 503, 520]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            transient_status_codes: default_transient_status_codes(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether a status code is classified as transient
    pub fn is_transient(&self, status_code: u16) -> bool {
        self.transient_status_codes.contains(&status_code)
    }

    /// Worst-case total sleep across all attempts
    pub fn worst_case_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }

    /// Issue `call` until it returns a non-transient status or attempts run out
    ///
    /// Non-transient replies (including non-2xx codes outside the transient
    /// set) are returned as-is. Errors from `call` itself are terminal.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Result<RemoteResponse<T>, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RemoteResponse<T>, CallError>>,
    {
        let mut attempt = 1;
        loop {
            let response = call().await?;
            if !self.is_transient(response.status_code) {
                if attempt > 1 {
                    debug!(call = label, attempt, status = response.status_code, "Call settled after retry");
                }
                return Ok(response);
            }

            if !self.should_retry(attempt) {
                warn!(
                    call = label,
                    attempts = attempt,
                    status = response.status_code,
                    "Retries exhausted"
                );
                return Err(CallError::RetriesExhausted {
                    attempts: attempt,
                    status: response.status_code,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                call = label,
                attempt,
                status = response.status_code,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
