use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Call `f`, retrying transient failures up to `max_retries` times.
///
/// Non-transient errors (content rejection, dimension mismatch) are returned immediately.
///
/// # Errors
///
/// Returns the last error once the retries are exhausted.
pub async fn retry_transient<T, F, Fut>(
    label: &str,
    max_retries: u32,
    backoff: Backoff,
    mut f: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    call = label,
                    attempt = attempt + 1,
                    max_retries,
                    "{e}, retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
