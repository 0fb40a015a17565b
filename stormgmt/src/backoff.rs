//! Bounded exponential retry.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Parameters of an exponential backoff loop.
///
/// The condition is invoked at most `retries` times. Before every attempt
/// except the first, the loop sleeps for the current delay and then scales
/// the delay by `factor`, clamped to `delay_limit` when one is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub delay: Duration,
    pub factor: f64,
    /// Zero disables clamping.
    pub delay_limit: Duration,
    pub retries: u32,
}

impl Backoff {
    pub const fn new(delay: Duration, factor: f64, delay_limit: Duration, retries: u32) -> Self {
        Self {
            delay,
            factor,
            delay_limit,
            retries,
        }
    }

    /// Constant delay between attempts.
    pub const fn constant(delay: Duration, retries: u32) -> Self {
        Self::new(delay, 1.0, Duration::ZERO, retries)
    }

    fn effective_factor(&self) -> f64 {
        if self.factor.is_finite() && self.factor > 0.0 {
            self.factor
        } else {
            1.0
        }
    }

    fn clamp(&self, delay: Duration, factor: f64) -> Duration {
        let limit = self.delay_limit;
        if limit.is_zero() {
            return delay;
        }
        if (factor > 1.0 && delay > limit) || (factor < 1.0 && delay < limit) {
            limit
        } else {
            delay
        }
    }

    /// Delays slept before attempts 1, 2, ... (attempt 0 runs immediately).
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let factor = self.effective_factor();
        let mut delay = self.clamp(self.delay, factor);
        std::iter::repeat_with(move || {
            let current = delay;
            let grown = Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
                .unwrap_or(Duration::MAX);
            delay = self.clamp(grown, factor);
            current
        })
        .take(self.retries.saturating_sub(1) as usize)
    }
}

/// Run `condition` under `backoff` until it reports completion or fails.
///
/// The condition returns `Ok(Some(v))` when done, `Ok(None)` to be retried
/// and `Err(e)` to abort; the error is returned unchanged. When the retries
/// are exhausted the result is `DeadlineExceeded`. A `retries` of zero never
/// invokes the condition.
pub async fn with_exponential_backoff<T, F, Fut>(backoff: &Backoff, mut condition: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut delays = backoff.delays();
    for attempt in 0..backoff.retries {
        if attempt != 0 {
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }
        if let Some(value) = condition().await? {
            return Ok(value);
        }
    }
    Err(Error::DeadlineExceeded("timed out".to_string()))
}

/// Retry `condition` up to `retries` times with a constant `delay`.
pub async fn with_retries<T, F, Fut>(retries: u32, delay: Duration, condition: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    with_exponential_backoff(&Backoff::constant(delay, retries), condition).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (calls.clone(), calls)
    }

    #[tokio::test]
    async fn zero_retries_never_invokes() {
        let (calls, seen) = counting();
        let backoff = Backoff::new(Duration::from_millis(1), 2.0, Duration::ZERO, 0);
        let result: Result<()> = with_exponential_backoff(&backoff, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(())) }
        })
        .await;
        assert!(matches!(result, Err(Error::DeadlineExceeded(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_success_invokes_once() {
        let (calls, seen) = counting();
        let backoff = Backoff::new(Duration::from_secs(60), 2.0, Duration::ZERO, 100);
        let value = with_exponential_backoff(&backoff, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(7)) }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_is_deadline_exceeded() {
        let (calls, seen) = counting();
        let result: Result<()> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;
        assert!(matches!(result, Err(Error::DeadlineExceeded(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn condition_error_is_returned_verbatim() {
        let (calls, seen) = counting();
        let result: Result<()> = with_retries(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Aborted("hook said no".to_string())) }
        })
        .await;
        assert_eq!(result, Err(Error::Aborted("hook said no".to_string())));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delays_grow_and_clamp() {
        let backoff = Backoff::new(
            Duration::from_millis(250),
            2.0,
            Duration::from_secs(2),
            6,
        );
        let delays: Vec<_> = backoff.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );
    }

    #[test]
    fn initial_delay_beyond_limit_starts_at_limit() {
        let backoff = Backoff::new(Duration::from_secs(5), 2.0, Duration::from_secs(1), 3);
        assert!(backoff.delays().all(|d| d == Duration::from_secs(1)));
    }

    #[test]
    fn shrinking_factor_clamps_from_below() {
        let backoff = Backoff::new(
            Duration::from_millis(800),
            0.5,
            Duration::from_millis(300),
            4,
        );
        let delays: Vec<_> = backoff.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(800),
                Duration::from_millis(400),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn nonpositive_factor_means_constant() {
        let backoff = Backoff::new(Duration::from_millis(10), -3.0, Duration::ZERO, 4);
        assert!(backoff.delays().all(|d| d == Duration::from_millis(10)));
    }
}
