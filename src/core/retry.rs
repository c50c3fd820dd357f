use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_jitter: Duration::from_secs(1),
        }
    }

    /// No sleeping at all; for tests and one-shot CLI calls.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// `base_delay * 2^attempt + uniform(0, max_jitter)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        let backoff = self.base_delay.saturating_mul(factor);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        backoff + Duration::from_millis(jitter)
    }

    pub async fn execute<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with_payload_check(label, op, |_| None).await
    }

    /// Like [`execute`](Self::execute), but `check` may turn an `Ok` payload
    /// into an error (e.g. a 200 response whose body reports a 429).
    pub async fn execute_with_payload_check<T, E, F, Fut, C>(
        &self,
        label: &str,
        mut op: F,
        check: C,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&T) -> Option<E>,
        E: Retryable + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match op().await {
                Ok(value) => match check(&value) {
                    None => return Ok(value),
                    Some(err) => err,
                },
                Err(err) => err,
            };

            if !outcome.is_retryable() || attempt >= self.max_retries {
                return Err(outcome);
            }

            let delay = self.delay_for(attempt);
            warn!(
                "Retrying '{}' in {:.2}s (attempt {}/{}): {}",
                label,
                delay.as_secs_f64(),
                attempt + 1,
                self.max_retries,
                outcome
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
