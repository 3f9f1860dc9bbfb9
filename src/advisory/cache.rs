//! Time-windowed cache for advisory results
//!
//! Sentiment and FUD-attack calls are slow and rate limited, so each symbol
//! keeps its last good answer and only asks again once it is older than the
//! TTL. A failed refresh falls back to the last good answer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

use crate::errors::TraderResult;

/// Payloads that carry an advisory confidence. Zero means "no real answer".
pub trait Confidence {
    fn confidence(&self) -> f64;

    fn has_confidence(&self) -> bool {
        self.confidence() != 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSignal<T> {
    pub value: Option<T>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> Default for CachedSignal<T> {
    fn default() -> Self {
        Self {
            value: None,
            fetched_at: None,
        }
    }
}

impl<T: Confidence + Clone> CachedSignal<T> {
    /// Cached value if it is younger than `ttl` and carries a confidence
    pub fn fresh(&self, now: DateTime<Utc>, ttl: Duration) -> Option<&T> {
        match (&self.value, self.fetched_at) {
            (Some(value), Some(at)) if now - at < ttl && value.has_confidence() => Some(value),
            _ => None,
        }
    }

    /// Any cached value worth serving after a failed refresh
    pub fn usable(&self) -> Option<&T> {
        self.value.as_ref().filter(|v| v.has_confidence())
    }

    pub fn store(&mut self, value: T, now: DateTime<Utc>) {
        self.value = Some(value);
        self.fetched_at = Some(now);
    }
}

/// Where a refreshed value came from
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    /// Reused without calling out
    Cached(T),
    /// Freshly fetched and stored
    Fetched(T),
    /// Refresh failed, previous value served
    Degraded(T),
    /// Refresh failed and nothing usable is cached
    Empty,
}

impl<T> FetchOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            FetchOutcome::Cached(v) | FetchOutcome::Fetched(v) | FetchOutcome::Degraded(v) => {
                Some(v)
            }
            FetchOutcome::Empty => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            FetchOutcome::Cached(v) | FetchOutcome::Fetched(v) | FetchOutcome::Degraded(v) => {
                Some(v)
            }
            FetchOutcome::Empty => None,
        }
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self, FetchOutcome::Fetched(_))
    }
}

/// Run `fetch`, retrying transient failures up to `retries` extra times.
pub async fn fetch_with_policy<T, F, Fut>(label: &str, retries: usize, mut fetch: F) -> TraderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TraderResult<T>>,
{
    let mut attempt = 0;
    loop {
        match fetch().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(source = label, attempt, error = %e, "Advisory fetch failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serve from cache, or refresh with retry and fall back to the last good value.
pub async fn refresh_cached<T, F, Fut>(
    cache: &mut CachedSignal<T>,
    label: &str,
    now: DateTime<Utc>,
    ttl: Duration,
    retries: usize,
    fetch: F,
) -> FetchOutcome<T>
where
    T: Confidence + Clone,
    F: FnMut() -> Fut,
    Fut: Future<Output = TraderResult<T>>,
{
    if let Some(value) = cache.fresh(now, ttl) {
        return FetchOutcome::Cached(value.clone());
    }

    match fetch_with_policy(label, retries, fetch).await {
        Ok(value) if value.has_confidence() => {
            cache.store(value.clone(), now);
            FetchOutcome::Fetched(value)
        }
        Ok(value) => match cache.usable() {
            // a neutral stand-in never replaces a real answer
            Some(previous) => {
                warn!(source = label, "Advisory returned no confidence, serving cached value");
                FetchOutcome::Degraded(previous.clone())
            }
            None => {
                cache.store(value.clone(), now);
                FetchOutcome::Fetched(value)
            }
        },
        Err(e) => match cache.usable() {
            Some(previous) => {
                warn!(source = label, error = %e, "Advisory unavailable, serving cached value");
                FetchOutcome::Degraded(previous.clone())
            }
            None => {
                warn!(source = label, error = %e, "Advisory unavailable and nothing cached");
                FetchOutcome::Empty
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TraderError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Reading(f64);

    impl Confidence for Reading {
        fn confidence(&self) -> f64 {
            self.0
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn young_value_is_reused_without_calling() {
        let mut cache = CachedSignal::default();
        cache.store(Reading(0.8), t0());
        let calls = AtomicUsize::new(0);

        let outcome = refresh_cached(&mut cache, "test", t0() + Duration::minutes(19), Duration::minutes(20), 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Reading(0.1)) }
        })
        .await;

        assert_eq!(outcome, FetchOutcome::Cached(Reading(0.8)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_value_is_refreshed() {
        let mut cache = CachedSignal::default();
        cache.store(Reading(0.8), t0());
        let now = t0() + Duration::minutes(20);

        let outcome = refresh_cached(&mut cache, "test", now, Duration::minutes(20), 1, || async {
            Ok(Reading(0.3))
        })
        .await;

        assert_eq!(outcome, FetchOutcome::Fetched(Reading(0.3)));
        assert_eq!(cache.fetched_at, Some(now));
    }

    #[tokio::test]
    async fn zero_confidence_cache_is_never_fresh() {
        let mut cache = CachedSignal::default();
        cache.store(Reading(0.0), t0());
        assert!(cache.fresh(t0(), Duration::minutes(20)).is_none());
        assert!(cache.usable().is_none());
    }

    #[tokio::test]
    async fn failure_serves_previous_value() {
        let mut cache = CachedSignal::default();
        cache.store(Reading(0.6), t0());

        let outcome = refresh_cached(&mut cache, "test", t0() + Duration::hours(1), Duration::minutes(20), 1, || async {
            Err::<Reading, _>(TraderError::advisory("503"))
        })
        .await;

        assert_eq!(outcome, FetchOutcome::Degraded(Reading(0.6)));
        // timestamp untouched so the next cycle tries again
        assert_eq!(cache.fetched_at, Some(t0()));
    }

    #[tokio::test]
    async fn failure_with_empty_cache_is_empty() {
        let mut cache: CachedSignal<Reading> = CachedSignal::default();
        let outcome = refresh_cached(&mut cache, "test", t0(), Duration::minutes(20), 1, || async {
            Err::<Reading, _>(TraderError::advisory("timeout"))
        })
        .await;
        assert_eq!(outcome, FetchOutcome::Empty);
        assert!(outcome.value().is_none());
    }

    #[tokio::test]
    async fn neutral_answer_does_not_replace_real_one() {
        let mut cache = CachedSignal::default();
        cache.store(Reading(0.9), t0());

        let outcome = refresh_cached(&mut cache, "test", t0() + Duration::hours(1), Duration::minutes(20), 1, || async {
            Ok(Reading(0.0))
        })
        .await;

        assert_eq!(outcome, FetchOutcome::Degraded(Reading(0.9)));
        assert_eq!(cache.value, Some(Reading(0.9)));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let calls = AtomicUsize::new(0);
        let result = fetch_with_policy("test", 1, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TraderError::advisory("connection reset"))
                } else {
                    Ok(Reading(0.5))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), Reading(0.5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicUsize::new(0);
        let result: TraderResult<Reading> = fetch_with_policy("test", 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TraderError::advisory("down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: TraderResult<Reading> = fetch_with_policy("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TraderError::Config("missing key".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
