//! Rate-limited, retrying dispatch of model backend calls.
//!
//! One `Dispatcher` exists per model tier for the whole run. Every attempt, retries
//! included, takes a token from the tier's limiter before it is sent.

use anyhow::{anyhow, Result};
use governor::{Quota, RateLimiter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;
use common::LlmConfig;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single backend call.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(llm: &LlmConfig) -> Self {
        Self {
            max_retries: llm.max_retries(),
            initial_backoff: Duration::from_millis(llm.initial_backoff_ms()),
            max_backoff: Duration::from_millis(llm.max_backoff_ms()),
            call_timeout: Duration::from_secs(llm.timeout_seconds()),
        }
    }

    /// Delay before retry number `retry` (0-based): initial * 2^retry, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct Dispatcher {
    tier: String,
    rpm: u32,
    limiter: Arc<DirectLimiter>,
    policy: RetryPolicy,
    dispatched: AtomicU64,
}

/// Spacing between dispatches: `60s / rpm` plus one millisecond, so `rpm + 1`
/// dispatches span more than 60s and no closed 60-second window holds more than `rpm`.
pub fn dispatch_period(rpm: u32) -> Duration {
    Duration::from_secs(60) / rpm.max(1) + Duration::from_millis(1)
}

impl Dispatcher {
    /// Dispatches are spaced by [`dispatch_period`] with a burst of one.
    pub fn new(tier: impl Into<String>, rpm: u32, policy: RetryPolicy) -> Result<Self> {
        let tier = tier.into();
        let rpm = rpm.max(1);
        let quota = Quota::with_period(dispatch_period(rpm))
            .ok_or_else(|| anyhow!("invalid rate for tier {}: {} rpm", tier, rpm))?;
        Ok(Self {
            tier,
            rpm,
            limiter: Arc::new(RateLimiter::direct(quota)),
            policy,
            dispatched: AtomicU64::new(0),
        })
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn rpm(&self) -> u32 {
        self.rpm
    }

    /// Number of attempts sent so far, retries included.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    async fn acquire(&self, label: &str) {
        if self.limiter.check().is_err() {
            debug!(tier = %self.tier, "Self-throttling before {}", label);
            self.limiter.until_ready().await;
        }
    }

    /// Run `op` under the rate limit, retrying transient failures with backoff.
    ///
    /// Permanent failures return immediately. A call exceeding the timeout counts as
    /// transient.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut retry = 0;
        loop {
            self.acquire(label).await;
            self.dispatched.fetch_add(1, Ordering::Relaxed);

            let outcome = match tokio::time::timeout(self.policy.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transient(format!(
                    "timed out after {}s",
                    self.policy.call_timeout.as_secs_f32()
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e @ ProviderError::Permanent(_)) => return Err(e),
                Err(e) if retry >= self.policy.max_retries => {
                    warn!(tier = %self.tier, "{} failed after {} attempts: {}", label, retry + 1, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.policy.backoff(retry);
                    warn!(
                        tier = %self.tier,
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        label,
                        retry + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert_eq!(policy.backoff(3), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dispatcher = Dispatcher::new("flash", 60_000, fast_policy(2)).unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = dispatcher
            .call("classify", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Transient("503".into()))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.dispatched(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let dispatcher = Dispatcher::new("flash", 60_000, fast_policy(3)).unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = dispatcher
            .call("classify", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Permanent("not json".into()))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let dispatcher = Dispatcher::new("flash", 60_000, fast_policy(1)).unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = dispatcher
            .call("classify", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Transient("429".into()))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_call_times_out_as_transient() {
        let mut policy = fast_policy(0);
        policy.call_timeout = Duration::from_millis(20);
        let dispatcher = Dispatcher::new("flash", 60_000, policy).unwrap();

        let result: Result<(), _> = dispatcher
            .call("classify", move || async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }

    #[test]
    fn period_keeps_closed_minute_within_rate() {
        for rpm in [1, 2, 7, 15, 60, 1000, 6000] {
            let period = dispatch_period(rpm);
            // rpm + 1 dispatches, first at t = 0, last at t = rpm * period.
            assert!(period * rpm > Duration::from_secs(60), "rpm {}", rpm);
            assert!(period * rpm <= Duration::from_secs(60) + Duration::from_millis(u64::from(rpm)));
        }
    }

    #[tokio::test]
    async fn dispatches_are_spaced_by_rate() {
        // 1200 rpm => one dispatch every 50ms
        let dispatcher = Dispatcher::new("flash", 1200, fast_policy(0)).unwrap();
        let start = Instant::now();
        for _ in 0..5 {
            dispatcher
                .call("ping", || async { Ok::<_, ProviderError>(()) })
                .await
                .unwrap();
        }
        // First is immediate, the other four wait ~51ms each.
        assert!(
            start.elapsed() >= Duration::from_millis(190),
            "rate limit not applied: {:?}",
            start.elapsed()
        );
    }
}
