//! Sliding-window rate limiting for provider calls.
//!
//! A limiter keeps the issue time of every token handed out during the last
//! window, so no rolling window ever sees more than `limit` accepted calls no
//! matter how many workers share it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::services::clock::Clock;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("no rate limit token available within {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Proof that one call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitToken {
    pub issued_at: DateTime<Utc>,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    issued: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    /// Limiter admitting `limit_per_minute` calls per rolling minute.
    pub fn per_minute(limit_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self::new(limit_per_minute, MINUTE, clock)
    }

    pub fn new(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: limit.max(1),
            window,
            clock,
            issued: Mutex::new(VecDeque::with_capacity(limit.max(1) as usize)),
        }
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.window.as_millis() as i64)
    }

    /// Takes a token if the window has room, otherwise returns how long
    /// until the oldest token leaves the window.
    pub fn try_acquire(&self) -> Result<RateLimitToken, Duration> {
        let now = self.clock.now();
        admit(&[self], now).map(|()| RateLimitToken { issued_at: now })
    }

    /// Waits for a token, giving up once `timeout` has passed.
    pub async fn acquire(&self, timeout: Duration) -> Result<RateLimitToken, RateLimitError> {
        wait_admitted(&[self], self.clock.as_ref(), timeout).await
    }

    /// Tokens that could be taken right now.
    pub fn available(&self) -> u32 {
        let now = self.clock.now();
        let window = self.window();
        let issued = self.issued.lock();
        let live = issued.iter().filter(|t| **t > now - window).count() as u32;
        self.limit.saturating_sub(live)
    }
}

/// Admits one call through every limiter at once, or through none.
///
/// All windows stay locked while they are checked, so a token is only
/// recorded when each limiter has room, and all of them record the same
/// instant. On refusal returns the longest wait among the full limiters.
fn admit(limiters: &[&RateLimiter], now: DateTime<Utc>) -> Result<(), Duration> {
    let mut held: Vec<_> = limiters
        .iter()
        .map(|&limiter| (limiter, limiter.issued.lock()))
        .collect();

    let mut wait = Duration::ZERO;
    for (limiter, issued) in held.iter_mut() {
        let window = limiter.window();
        while issued.front().is_some_and(|t| *t <= now - window) {
            issued.pop_front();
        }
        if issued.len() as u32 >= limiter.limit {
            let until_free = issued
                .front()
                .and_then(|oldest| (*oldest + window - now).to_std().ok())
                .unwrap_or_default();
            wait = wait.max(until_free.max(Duration::from_millis(1)));
        }
    }
    if !wait.is_zero() {
        return Err(wait);
    }

    for (_, issued) in held.iter_mut() {
        issued.push_back(now);
    }
    Ok(())
}

async fn wait_admitted(
    limiters: &[&RateLimiter],
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<RateLimitToken, RateLimitError> {
    let started = clock.now();
    let deadline = started + chrono::Duration::milliseconds(timeout.as_millis() as i64);
    loop {
        let now = clock.now();
        let wait = match admit(limiters, now) {
            Ok(()) => {
                let waited = (now - started).num_milliseconds().max(0);
                metrics::histogram!("rate_limiter_wait_seconds").record(waited as f64 / 1000.0);
                return Ok(RateLimitToken { issued_at: now });
            }
            Err(wait) => wait,
        };

        let left = (deadline - now).to_std().unwrap_or_default();
        if left.is_zero() {
            return Err(RateLimitError::Timeout(timeout));
        }

        tracing::debug!(
            wait_ms = wait.min(left).as_millis() as u64,
            limiters = limiters.len(),
            "Rate limit window full, waiting"
        );
        clock.sleep(wait.min(left)).await;
    }
}

/// Every limiter a call has to pass. A token is taken from all of them in
/// one step, so waiting on one never spends another's allowance.
#[derive(Clone)]
pub struct LimiterChain {
    limiters: Vec<Arc<RateLimiter>>,
}

impl LimiterChain {
    pub fn new(mut limiters: Vec<Arc<RateLimiter>>) -> Self {
        // One global lock order for chains sharing a limiter.
        limiters.sort_by_key(|limiter| Arc::as_ptr(limiter) as usize);
        limiters.dedup_by(|a, b| Arc::ptr_eq(a, b));
        Self { limiters }
    }

    pub async fn acquire(
        &self,
        clock: &dyn Clock,
        timeout: Duration,
    ) -> Result<RateLimitToken, RateLimitError> {
        let limiters: Vec<&RateLimiter> = self.limiters.iter().map(Arc::as_ref).collect();
        wait_admitted(&limiters, clock, timeout).await
    }
}

/// Shared limiters keyed by provider credential, so that jobs spending the
/// same quota also share one window.
pub struct RateLimiterRegistry {
    clock: Arc<dyn Clock>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            limiters: DashMap::new(),
        }
    }

    /// Returns the limiter for `scope`, creating it at `limit_per_minute`
    /// on first use.
    pub fn shared(&self, scope: &str, limit_per_minute: u32) -> Arc<RateLimiter> {
        self.limiters
            .entry(scope.to_string())
            .or_insert_with(|| {
                tracing::info!(scope, limit_per_minute, "Creating shared rate limiter");
                Arc::new(RateLimiter::per_minute(
                    limit_per_minute,
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::default())
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_within_limit() {
        let clock = clock();
        let limiter = RateLimiter::per_minute(3, clock.clone());

        for _ in 0..3 {
            assert!(limiter.try_acquire().is_ok());
        }
        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(60));
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_rate_limiter_waits_for_window() {
        let clock = clock();
        let limiter = RateLimiter::per_minute(2, clock.clone());
        let first = limiter.acquire(Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(10));
        limiter.acquire(Duration::from_secs(1)).await.unwrap();

        let third = limiter.acquire(Duration::from_secs(120)).await.unwrap();

        assert!(third.issued_at - first.issued_at >= chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_rate_limiter_times_out() {
        let clock = clock();
        let limiter = RateLimiter::per_minute(1, clock.clone());
        limiter.acquire(Duration::from_secs(1)).await.unwrap();

        let start = clock.now();
        let result = limiter.acquire(Duration::from_secs(10)).await;

        assert_eq!(result, Err(RateLimitError::Timeout(Duration::from_secs(10))));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_rate_limiter_concurrent_window_bound() {
        let clock = clock();
        let limiter = Arc::new(RateLimiter::per_minute(10, clock.clone()));

        let mut handles = vec![];
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut issued = vec![];
                for _ in 0..5 {
                    let token = limiter.acquire(Duration::from_secs(86_400)).await.unwrap();
                    issued.push(token.issued_at);
                }
                issued
            }));
        }

        let mut all = vec![];
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();

        assert_eq!(all.len(), 40);
        for pair in all.windows(11) {
            assert!(
                pair[10] - pair[0] >= chrono::Duration::seconds(60),
                "11 tokens issued inside one minute"
            );
        }
    }

    #[tokio::test]
    async fn test_chain_respects_strictest_limiter() {
        let clock = clock();
        let job = Arc::new(RateLimiter::per_minute(1, clock.clone()));
        let shared = Arc::new(RateLimiter::per_minute(100, clock.clone()));
        let chain = LimiterChain::new(vec![job, Arc::clone(&shared)]);

        chain.acquire(clock.as_ref(), Duration::from_secs(5)).await.unwrap();
        let second = chain.acquire(clock.as_ref(), Duration::from_secs(5)).await;

        assert!(second.is_err());
        assert_eq!(shared.available(), 99);
    }

    #[tokio::test]
    async fn test_chain_keeps_job_rate_while_shared_window_is_full() {
        let clock = clock();
        let job = Arc::new(RateLimiter::per_minute(2, clock.clone()));
        let shared = Arc::new(RateLimiter::per_minute(4, clock.clone()));
        for _ in 0..4 {
            shared.try_acquire().unwrap();
        }
        let chain = LimiterChain::new(vec![job, shared]);

        let mut handles = vec![];
        for _ in 0..4 {
            let chain = chain.clone();
            let clock = clock.clone();
            handles.push(tokio::spawn(async move {
                chain
                    .acquire(clock.as_ref(), Duration::from_secs(86_400))
                    .await
                    .unwrap()
                    .issued_at
            }));
        }

        let mut issued = vec![];
        for handle in handles {
            issued.push(handle.await.unwrap());
        }
        issued.sort();

        for triple in issued.windows(3) {
            assert!(
                triple[2] - triple[0] >= chrono::Duration::seconds(60),
                "3 calls admitted inside one minute for a job limit of 2"
            );
        }
    }

    #[tokio::test]
    async fn test_chain_timeout_spends_no_tokens() {
        let clock = clock();
        let job = Arc::new(RateLimiter::per_minute(1, clock.clone()));
        let shared = Arc::new(RateLimiter::per_minute(1, clock.clone()));
        shared.try_acquire().unwrap();
        let chain = LimiterChain::new(vec![Arc::clone(&job), shared]);

        let result = chain.acquire(clock.as_ref(), Duration::from_secs(5)).await;

        assert_eq!(result, Err(RateLimitError::Timeout(Duration::from_secs(5))));
        assert_eq!(job.available(), 1);
    }

    #[test]
    fn test_registry_shares_limiter_per_scope() {
        let registry = RateLimiterRegistry::new(clock());
        let a = registry.shared("team-key", 10);
        let b = registry.shared("team-key", 10);
        let c = registry.shared("other-key", 10);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
