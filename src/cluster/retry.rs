//! Retry and jitter policies.
//!
//! Only two engine paths retry on their own: candidacy (a failed election is
//! retried after a jittered exponential backoff) and the leader heartbeat
//! (each period is jittered so leaders of different clusters sharing a network
//! do not synchronize). Durable writes use [`storage_policy`]. Everything else
//! fails fast to the caller.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `election_backoff` | election timeout | 8x timeout | 16 | Candidate retries |
//! | `storage_policy` | 10ms | 500ms | 3 | Object store writes |

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder, Retryable};

/// Backoff for repeated candidacies, starting at the base election timeout.
pub fn election_backoff(base: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(base)
        .with_max_delay(base * 8)
        .with_factor(2.0)
        .with_max_times(16)
        .with_jitter()
}

/// Policy for durable state writes.
pub fn storage_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Execute an async operation with the storage retry policy.
pub async fn with_storage_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(storage_policy()).when(condition).await
}

/// A randomized duration in `[0, base * factor]`.
pub fn jitter_duration(base: Duration, factor: f64) -> Duration {
    let max_jitter_ms = (base.as_millis() as f64 * factor.max(0.0)) as u64;
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=max_jitter_ms))
}

/// Apply +/-15% jitter to a period.
pub fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

/// A first election timeout drawn from `[base, base * (1 + factor)]`.
pub fn election_timeout(base: Duration, factor: f64) -> Duration {
    base + jitter_duration(base, factor)
}

/// Candidate-side retry schedule.
///
/// `next_delay` walks the exponential backoff; once exhausted it keeps
/// returning the jittered maximum. `reset` is called whenever a leader is
/// recognised.
pub struct ElectionBackoff {
    base: Duration,
    jitter_factor: f64,
    attempts: u32,
    inner: ExponentialBackoff,
}

impl ElectionBackoff {
    pub fn new(base: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            jitter_factor,
            attempts: 0,
            inner: election_backoff(base).build(),
        }
    }

    /// Delay before the next election attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        if self.attempts == 1 {
            return election_timeout(self.base, self.jitter_factor);
        }
        record_retry_attempt("election", self.attempts);
        match self.inner.next() {
            Some(delay) => delay,
            None => {
                record_retry_exhausted("election");
                self.base * 8 + jitter_duration(self.base, self.jitter_factor)
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.inner = election_backoff(self.base).build();
    }
}

impl std::fmt::Debug for ElectionBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionBackoff")
            .field("base", &self.base)
            .field("jitter_factor", &self.jitter_factor)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion.
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_election_timeout_within_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..200 {
            let t = election_timeout(base, 1.0);
            assert!(t >= base && t <= base * 2);
        }
    }

    #[test]
    fn test_zero_jitter_factor_is_exact() {
        let base = Duration::from_millis(250);
        assert_eq!(election_timeout(base, 0.0), base);
    }

    #[test]
    fn test_with_jitter_range() {
        let base = Duration::from_secs(1);
        for _ in 0..200 {
            let j = with_jitter(base);
            assert!(j >= Duration::from_millis(849) && j <= Duration::from_millis(1151));
        }
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let base = Duration::from_millis(100);
        let mut backoff = ElectionBackoff::new(base, 0.0);
        assert_eq!(backoff.next_delay(), base);
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d >= base);
            assert!(d <= base * 8 * 2 + base);
            last = d;
        }
        assert!(last >= base * 8);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), base);
    }

    #[tokio::test]
    async fn test_storage_policy_retries_until_success() {
        let attempts = AtomicU32::new(0);

        let result = with_storage_policy(
            || async {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                } else {
                    Ok(7)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_storage_policy_respects_condition() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), std::io::Error> = with_storage_policy(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            },
            |e| e.kind() == std::io::ErrorKind::TimedOut,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
