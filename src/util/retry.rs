use std::time::Duration;
use tokio::time::sleep;
use rand::Rng;

/// Exponential backoff with full jitter, shared by the ingest stage (§4.5:
/// base 100ms, cap 30s, 10 attempts) and the sink stage (§4.8: retry inside
/// the same batch before splitting).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts }
    }

    pub fn ingest() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30), 10)
    }

    pub fn sink() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(5), 5)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let doubled = base_ms.saturating_mul(1u64 << attempt.min(32)).min(cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=doubled / 2 + 1);
        Duration::from_millis(doubled.saturating_add(jitter).min(cap_ms))
    }

    /// Run `f` under this policy, retrying while `is_retryable(&err)` holds,
    /// up to `max_attempts`.
    pub async fn run<F, Fut, T, E>(
        &self,
        mut is_retryable: impl FnMut(&E) -> bool,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let retryable = is_retryable(&e);
                    last_error = Some(e);
                    if !retryable || attempt + 1 >= self.max_attempts {
                        break;
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                    sleep(delay).await;
                }
            }
        }
        Err(last_error.expect("at least one attempt runs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn backoff_policy_stops_on_non_retryable() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 5);
        let attempts = Arc::new(AtomicU32::new(0));
        let a2 = attempts.clone();
        let result: Result<(), &str> = policy
            .run(|_e| false, || {
                let a = a2.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err("permanent")
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_policy_retries_until_exhausted() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 3);
        let attempts = Arc::new(AtomicU32::new(0));
        let a2 = attempts.clone();
        let result: Result<(), &str> = policy
            .run(|_e| true, || {
                let a = a2.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err("transient")
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
