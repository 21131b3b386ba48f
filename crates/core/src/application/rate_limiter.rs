// Rate Limiter - token bucket shared by every outbound API call
// Tokens accrue at requests_per_hour / 3600 per second up to burst_size.
// The lock covers only the token arithmetic; callers sleep with it released.
// Throttling responses grow a jittered exponential backoff until max_retries.

use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Slack for float drift after sleeping exactly the computed deficit
const TOKEN_EPSILON: f64 = 1e-9;

/// Jitter bounds applied to the computed backoff
const JITTER_MIN: f64 = 0.75;
const JITTER_MAX: f64 = 1.25;

/// Answer to a throttling response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    /// How long to wait before the next attempt
    pub backoff: Duration,
    /// Whether another attempt is permitted
    pub retry: bool,
    /// Consecutive throttling responses so far
    pub failures: u32,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    consecutive_failures: u32,
}

impl BucketState {
    fn refill(&mut self, now: Instant, per_sec: f64, burst: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(burst);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        let per_sec = config.refill_per_sec().max(f64::MIN_POSITIVE);
        let burst = f64::from(config.burst_size.max(1));
        Self {
            config,
            per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // Every critical section is a single arithmetic update, so a
        // poisoned lock still holds consistent state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until one token is available, then consume it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.lock();
                state.refill(Instant::now(), self.per_sec, self.burst);
                if state.tokens >= 1.0 - TOKEN_EPSILON {
                    state.tokens = (state.tokens - 1.0).max(0.0);
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.per_sec)
            };

            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting for token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a successful call: the next throttling episode starts from base
    pub fn on_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
    }

    /// Record a throttling response and decide whether to try again.
    ///
    /// `retry_after` is the server's hint and, when present, replaces the
    /// computed backoff.
    pub fn on_throttled(&self, retry_after: Option<Duration>) -> ThrottleDecision {
        let failures = {
            let mut state = self.lock();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_failures
        };

        if failures > self.config.max_retries {
            warn!(
                failures = failures,
                max_retries = self.config.max_retries,
                "Throttling retry ceiling exceeded"
            );
            return ThrottleDecision {
                backoff: Duration::ZERO,
                retry: false,
                failures,
            };
        }

        let backoff = match retry_after {
            Some(hint) => hint,
            None => jitter(self.base_backoff(failures)),
        };

        warn!(
            failures = failures,
            backoff_ms = backoff.as_millis() as u64,
            server_hint = retry_after.is_some(),
            "Throttled by remote API, backing off"
        );

        ThrottleDecision {
            backoff,
            retry: true,
            failures,
        }
    }

    /// Un-jittered backoff after `failures` consecutive throttling responses:
    /// `min(max_backoff, base * multiplier^(failures - 1))`
    pub fn base_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.base_backoff().as_secs_f64();
        let scaled = base * self.config.backoff_multiplier.powi(exponent);
        let max = self.config.max_backoff().as_secs_f64();
        if !scaled.is_finite() || scaled >= max {
            self.config.max_backoff()
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Tokens currently in the bucket (diagnostics)
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock();
        state.refill(Instant::now(), self.per_sec, self.burst);
        state.tokens
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }
}

/// Scale by a uniform factor in `[0.75, 1.25]`
fn jitter(backoff: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    backoff.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(requests_per_hour: u32, burst_size: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_hour,
            burst_size,
            max_retries: 3,
            base_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_served_immediately() {
        let limiter = RateLimiter::new(config(3600, 5));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
        assert!(limiter.available_tokens() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bucket_parks_until_refill() {
        let limiter = RateLimiter::new(config(3600, 1));
        limiter.acquire().await;

        let mut waiting = tokio_test::task::spawn(limiter.acquire());
        tokio_test::assert_pending!(waiting.poll());

        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio_test::assert_ready!(waiting.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_calls_never_block() {
        // 1 token per second, bucket of 1
        let limiter = RateLimiter::new(config(3600, 1));
        for _ in 0..5 {
            let before = Instant::now();
            limiter.acquire().await;
            assert_eq!(Instant::now(), before, "acquire blocked despite spacing");
            tokio::time::advance(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_converges_to_refill_rate() {
        // 1 token per second, burst of 5: 15 calls need 10 more tokens
        let limiter = RateLimiter::new(config(3600, 5));
        let start = Instant::now();
        for _ in 0..15 {
            limiter.acquire().await;
        }
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(9_990), "too fast: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(10_100), "too slow: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_burst() {
        let limiter = RateLimiter::new(config(3600, 3));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(limiter.available_tokens() <= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_share_the_bucket() {
        let limiter = Arc::new(RateLimiter::new(config(3600, 2)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 2 from the burst, 8 refilled at 1/s
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(7_990), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(8_100), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_base_backoff_is_monotonic_and_capped() {
        let limiter = RateLimiter::new(config(3600, 1));
        let expected = [1000, 2000, 4000, 5000, 5000];
        let mut previous = Duration::ZERO;
        for (i, ms) in expected.iter().enumerate() {
            let backoff = limiter.base_backoff(i as u32 + 1);
            assert_eq!(backoff, Duration::from_millis(*ms));
            assert!(backoff >= previous);
            previous = backoff;
        }
    }

    #[tokio::test]
    async fn test_throttled_gives_up_after_max_retries() {
        let limiter = RateLimiter::new(config(3600, 1));
        for attempt in 1..=3 {
            let decision = limiter.on_throttled(None);
            assert!(decision.retry, "attempt {} should retry", attempt);
            assert_eq!(decision.failures, attempt);
            let base = limiter.base_backoff(attempt);
            assert!(decision.backoff >= base.mul_f64(JITTER_MIN));
            assert!(decision.backoff <= base.mul_f64(JITTER_MAX));
        }
        let decision = limiter.on_throttled(None);
        assert!(!decision.retry);
        assert_eq!(decision.failures, 4);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let limiter = RateLimiter::new(config(3600, 1));
        limiter.on_throttled(None);
        limiter.on_throttled(None);
        assert_eq!(limiter.consecutive_failures(), 2);

        limiter.on_success();
        assert_eq!(limiter.consecutive_failures(), 0);

        let decision = limiter.on_throttled(None);
        assert_eq!(decision.failures, 1);
        assert!(decision.backoff <= Duration::from_millis(1250));
    }

    #[tokio::test]
    async fn test_server_hint_overrides_backoff() {
        let limiter = RateLimiter::new(config(3600, 1));
        let decision = limiter.on_throttled(Some(Duration::from_secs(42)));
        assert!(decision.retry);
        assert_eq!(decision.backoff, Duration::from_secs(42));
    }
}
