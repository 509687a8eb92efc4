//! Retry with exponential backoff for adapter calls

use std::future::Future;
use std::time::Duration;

use crate::error::{AdapterErrorCode, AdapterResult};

/// Backoff ceiling
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let ms = base_ms
        .saturating_mul(1u64 << exponent)
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// What kind of call is being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOp {
    Upload,
    Download,
    List,
    Delete,
}

/// Outcome of a retried call
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: AdapterResult<T>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Whether a failed call may be attempted again
    pub fn should_retry(op: RetryOp, code: AdapterErrorCode) -> bool {
        if code.is_terminal() {
            return false;
        }
        // A missing key on delete is already the desired end state
        !(op == RetryOp::Delete && code == AdapterErrorCode::NotFound)
    }

    pub async fn run<T, F, Fut>(&self, op: RetryOp, label: &str, mut call: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if attempt < self.max_attempts && Self::should_retry(op, e.code) => {
                    let delay = backoff_delay(self.base_delay_ms, attempt);
                    tracing::warn!(
                        op = ?op,
                        target_key = label,
                        attempt,
                        code = %e.code,
                        delay_ms = delay.as_millis() as u64,
                        "adapter call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
