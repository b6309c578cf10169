//! Bar sources and the shared history cache
//!
//! `BarSource` is the single seam for price history. `CachedBarSource` wraps
//! any source with a TTL cache keyed by (symbol, interval, range), collapses
//! concurrent requests for the same key into one upstream call, bounds the
//! number of upstream calls in flight, and applies one timeout and
//! retry/backoff policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::types::Bar;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("No bars for {0}")]
    Empty(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl DataError {
    /// Transport failures, timeouts, throttling and server errors are retried
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::Http(_) | DataError::Timeout(_) => true,
            DataError::Status { status, .. } => *status == 429 || *status >= 500,
            DataError::Parse(_) | DataError::Empty(_) => false,
        }
    }
}

/// Anything that can produce ascending OHLCV bars for a symbol
#[async_trait]
pub trait BarSource: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<Vec<Bar>, DataError>;
}

#[async_trait]
impl<S: BarSource + ?Sized> BarSource for Arc<S> {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<Vec<Bar>, DataError> {
        (**self).fetch_bars(symbol, interval, range).await
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_concurrent_fetches: usize,
    pub fetch_timeout: Duration,
    /// Attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt
    pub retry_backoff: Duration,
    pub ttl_minute_bars: Duration,
    pub ttl_daily_bars: Duration,
    pub ttl_other: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 10,
            fetch_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            ttl_minute_bars: Duration::from_secs(2 * 60),
            ttl_daily_bars: Duration::from_secs(30 * 60),
            ttl_other: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl CacheConfig {
    /// "5m" → minute TTL, "1d" → daily TTL, anything else ("1h", "1wk", "1mo") → long TTL
    pub fn ttl_for(&self, interval: &str) -> Duration {
        if interval.ends_with('m') {
            self.ttl_minute_bars
        } else if interval.ends_with('d') {
            self.ttl_daily_bars
        } else {
            self.ttl_other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: String,
    interval: String,
    range: String,
}

struct CacheEntry {
    bars: Arc<Vec<Bar>>,
    fetched_at: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Memoizing, deduplicating, bounded wrapper around a `BarSource`
pub struct CachedBarSource<S> {
    inner: S,
    config: CacheConfig,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    permits: Semaphore,
    upstream_calls: AtomicU64,
}

impl<S: BarSource> CachedBarSource<S> {
    pub fn new(inner: S, config: CacheConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent_fetches.max(1));
        Self {
            inner,
            config,
            slots: Mutex::new(HashMap::new()),
            permits,
            upstream_calls: AtomicU64::new(0),
        }
    }

    /// Upstream requests issued so far (retries included)
    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    fn slot(&self, key: CacheKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key).or_default().clone()
    }

    /// Cached bars, or `None` when the source has nothing usable
    pub async fn bars(&self, symbol: &str, interval: &str, range: &str) -> Option<Vec<Bar>> {
        self.get(symbol, interval, range).await.ok()
    }

    async fn get(&self, symbol: &str, interval: &str, range: &str) -> Result<Vec<Bar>, DataError> {
        let slot = self.slot(CacheKey {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            range: range.to_string(),
        });

        // Holding the slot lock while fetching makes concurrent callers for the
        // same key wait for this fetch instead of issuing their own
        let mut entry = slot.lock().await;
        let ttl = self.config.ttl_for(interval);
        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() < ttl {
                debug!(symbol, interval, range, "Cache hit");
                return Ok(cached.bars.as_ref().clone());
            }
        }

        match self.fetch_with_retry(symbol, interval, range).await {
            Ok(bars) => {
                let bars = Arc::new(bars);
                *entry = Some(CacheEntry {
                    bars: bars.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(bars.as_ref().clone())
            }
            Err(e) => match entry.as_ref() {
                Some(stale) => {
                    warn!(symbol, interval, error = %e, "Fetch failed, serving stale bars");
                    Ok(stale.bars.as_ref().clone())
                }
                None => Err(e),
            },
        }
    }

    async fn fetch_with_retry(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<Vec<Bar>, DataError> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| DataError::Http(e.to_string()))?;
                self.upstream_calls.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(
                    self.config.fetch_timeout,
                    self.inner.fetch_bars(symbol, interval, range),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DataError::Timeout(self.config.fetch_timeout)),
                }
            };

            match result {
                Ok(bars) if bars.is_empty() => return Err(DataError::Empty(symbol.to_string())),
                Ok(bars) => return Ok(bars),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    debug!(symbol, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(symbol, interval, range, error = %e, "Fetch failed");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<S: BarSource> BarSource for CachedBarSource<S> {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<Vec<Bar>, DataError> {
        self.get(symbol, interval, range).await
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// Tries `primary`, and on any failure serves `fallback` instead
pub struct FallbackBarSource<P, F> {
    primary: P,
    fallback: F,
}

impl<P: BarSource, F: BarSource> FallbackBarSource<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P: BarSource, F: BarSource> BarSource for FallbackBarSource<P, F> {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<Vec<Bar>, DataError> {
        match self.primary.fetch_bars(symbol, interval, range).await {
            Ok(bars) if !bars.is_empty() => Ok(bars),
            Ok(_) | Err(_) => {
                debug!(symbol, "Primary source failed, using fallback series");
                self.fallback.fetch_bars(symbol, interval, range).await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicUsize;

    /// Serves fixed series; unknown symbols fail with a 404
    pub(crate) struct StaticSource {
        pub series: HashMap<String, Vec<Bar>>,
        pub calls: AtomicUsize,
        pub delay: Duration,
    }

    impl StaticSource {
        pub(crate) fn new(series: HashMap<String, Vec<Bar>>) -> Self {
            Self {
                series,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl BarSource for StaticSource {
        async fn fetch_bars(&self, symbol: &str, _: &str, _: &str) -> Result<Vec<Bar>, DataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.series.get(symbol).cloned().ok_or(DataError::Status {
                status: 404,
                body: format!("unknown symbol {symbol}"),
            })
        }
    }

    /// Fails with a retryable error `failures` times, then succeeds
    struct FlakySource {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BarSource for FlakySource {
        async fn fetch_bars(&self, _: &str, _: &str, _: &str) -> Result<Vec<Bar>, DataError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(DataError::Status {
                    status: 503,
                    body: "busy".to_string(),
                })
            } else {
                Ok(vec![bar(1)])
            }
        }
    }

    fn bar(time: i64) -> Bar {
        Bar {
            time,
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            volume: Decimal::ONE,
        }
    }

    fn fast_config() -> CacheConfig {
        CacheConfig {
            retry_backoff: Duration::from_millis(1),
            fetch_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_ttl_by_interval() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_for("5m"), Duration::from_secs(120));
        assert_eq!(config.ttl_for("1d"), Duration::from_secs(1800));
        assert_eq!(config.ttl_for("1wk"), Duration::from_secs(4 * 3600));
        assert_eq!(config.ttl_for("1mo"), Duration::from_secs(4 * 3600));
    }

    #[tokio::test]
    async fn test_concurrent_requests_collapse_into_one_call() {
        let mut source = StaticSource::new(HashMap::from([("INFY".to_string(), vec![bar(1)])]));
        source.delay = Duration::from_millis(20);
        let cache = CachedBarSource::new(source, fast_config());

        let (a, b, c) = tokio::join!(
            cache.bars("INFY", "5m", "1d"),
            cache.bars("INFY", "5m", "1d"),
            cache.bars("INFY", "5m", "1d"),
        );
        assert!(a.is_some() && b.is_some() && c.is_some());
        assert_eq!(cache.upstream_calls(), 1);

        // Different key is a different entry
        cache.bars("INFY", "1d", "1mo").await;
        assert_eq!(cache.upstream_calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let source = StaticSource::new(HashMap::from([("INFY".to_string(), vec![bar(1)])]));
        let cache = CachedBarSource::new(
            source,
            CacheConfig {
                ttl_minute_bars: Duration::ZERO,
                ..fast_config()
            },
        );
        cache.bars("INFY", "5m", "1d").await;
        cache.bars("INFY", "5m", "1d").await;
        assert_eq!(cache.upstream_calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_returns_none_without_retrying_404() {
        let cache = CachedBarSource::new(StaticSource::new(HashMap::new()), fast_config());
        assert!(cache.bars("NOPE", "5m", "1d").await.is_none());
        assert_eq!(cache.upstream_calls(), 1);
    }

    #[tokio::test]
    async fn test_retryable_errors_are_retried() {
        let cache = CachedBarSource::new(
            FlakySource {
                failures: 2,
                calls: AtomicUsize::new(0),
            },
            fast_config(),
        );
        assert_eq!(cache.bars("X", "1d", "1y").await.unwrap().len(), 1);
        assert_eq!(cache.upstream_calls(), 3);

        let cache = CachedBarSource::new(
            FlakySource {
                failures: 5,
                calls: AtomicUsize::new(0),
            },
            fast_config(),
        );
        assert!(cache.bars("X", "1d", "1y").await.is_none());
        assert_eq!(cache.upstream_calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let mut source = StaticSource::new(HashMap::from([("INFY".to_string(), vec![bar(1)])]));
        source.delay = Duration::from_secs(5);
        let cache = CachedBarSource::new(
            source,
            CacheConfig {
                max_retries: 0,
                fetch_timeout: Duration::from_millis(10),
                ..fast_config()
            },
        );
        let err = cache.fetch_bars("INFY", "5m", "1d").await.unwrap_err();
        assert!(matches!(err, DataError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_fallback_source() {
        let primary = StaticSource::new(HashMap::new());
        let fallback = StaticSource::new(HashMap::from([("INFY".to_string(), vec![bar(7)])]));
        let source = FallbackBarSource::new(primary, fallback);
        let bars = source.fetch_bars("INFY", "5m", "1d").await.unwrap();
        assert_eq!(bars[0].time, 7);
    }
}
