//! Feed adapters: one per external market-data source.
//!
//! Each adapter owns its own TTL cache and touches no shared state. Polling is
//! single-flight per source: concurrent callers inside the TTL window coalesce
//! on the cache instead of triggering duplicate fetches. A failed fetch falls
//! back to the last-known snapshot marked stale; only a failure with no cache
//! at all propagates the error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use crate::logging::{obj, v_num, v_str, warn_log};
use crate::types::MarketSnapshot;

pub mod http;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Timeout,
    AuthFailure,
    RateLimited,
    Malformed(String),
}

impl SourceError {
    /// Transient errors are retried inside the adapter (bounded); the rest
    /// fail the fetch immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Timeout | SourceError::RateLimited)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceError::Timeout => "timeout",
            SourceError::AuthFailure => "auth_failure",
            SourceError::RateLimited => "rate_limited",
            SourceError::Malformed(_) => "malformed",
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Malformed(msg) => write!(f, "malformed feed payload: {}", msg),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl std::error::Error for SourceError {}

#[async_trait]
pub trait MarketSource: Send + Sync {
    fn source_id(&self) -> &str;
    async fn fetch(&self, now_ts: u64) -> Result<MarketSnapshot, SourceError>;
}

/// Synthetic deterministic feed used when no live endpoint is configured
/// (paper mode) and by tests.
pub struct StaticSource {
    id: String,
    fields: BTreeMap<String, f64>,
}

impl StaticSource {
    pub fn new(id: &str, fields: &[(&str, f64)]) -> Self {
        Self {
            id: id.to_string(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

#[async_trait]
impl MarketSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, now_ts: u64) -> Result<MarketSnapshot, SourceError> {
        Ok(MarketSnapshot {
            source_id: self.id.clone(),
            captured_at: now_ts,
            fields: self.fields.clone(),
            stale: false,
        })
    }
}

/// Bounded in-adapter retry for transient fetch failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 100 }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self.base_delay_ms.saturating_mul(1u64 << attempt.min(8));
        // Jitter desynchronizes retries across sources hitting the same host.
        let jitter = rand::thread_rng().gen_range(0..=ms / 4);
        Duration::from_millis(ms.saturating_add(jitter))
    }
}

/// TTL-cached wrapper around a concrete source. Owns the staleness cache for
/// its source and nothing else.
pub struct CachedSource {
    inner: Box<dyn MarketSource>,
    ttl_secs: u64,
    fetch_timeout: Duration,
    retry: RetryPolicy,
    // Mutex doubles as the single-flight guard: the first caller fetches,
    // the rest wait and then hit the refreshed cache.
    slot: Mutex<Option<MarketSnapshot>>,
}

impl CachedSource {
    pub fn new(
        inner: Box<dyn MarketSource>,
        ttl_secs: u64,
        fetch_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self { inner, ttl_secs, fetch_timeout, retry, slot: Mutex::new(None) }
    }

    pub fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    pub async fn poll(&self, now_ts: u64) -> Result<MarketSnapshot, SourceError> {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(now_ts, self.ttl_secs) {
                return Ok(cached.clone());
            }
        }

        match self.fetch_with_retry(now_ts).await {
            Ok(snapshot) => {
                *slot = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => match slot.as_ref() {
                Some(cached) => {
                    warn_log(
                        "source",
                        obj(&[
                            ("event", v_str("stale_fallback")),
                            ("source", v_str(self.inner.source_id())),
                            ("error", v_str(err.as_str())),
                            ("cached_age_secs", v_num(cached.age_secs(now_ts) as f64)),
                        ]),
                    );
                    let mut stale = cached.clone();
                    stale.stale = true;
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    async fn fetch_with_retry(&self, now_ts: u64) -> Result<MarketSnapshot, SourceError> {
        let mut attempt = 0u32;
        loop {
            let result = match timeout(self.fetch_timeout, self.inner.fetch(now_ts)).await {
                Ok(inner) => inner,
                Err(_) => Err(SourceError::Timeout),
            };
            match result {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    warn_log(
                        "source",
                        obj(&[
                            ("event", v_str("retry")),
                            ("source", v_str(self.inner.source_id())),
                            ("error", v_str(err.as_str())),
                            ("attempt", v_num((attempt + 1) as f64)),
                        ]),
                    );
                    sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Poll every source concurrently, one task per source, each bounded by its
/// own timeout inside `poll`. A slow source delays only itself.
pub async fn poll_all(
    sources: &[Arc<CachedSource>],
    now_ts: u64,
) -> Vec<(String, Result<MarketSnapshot, SourceError>)> {
    let futures = sources.iter().map(|src| {
        let src = Arc::clone(src);
        async move {
            let id = src.source_id().to_string();
            let result = src.poll(now_ts).await;
            (id, result)
        }
    });
    join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted source: pops one canned result per fetch.
    struct ScriptedSource {
        id: String,
        script: StdMutex<VecDeque<Result<BTreeMap<String, f64>, SourceError>>>,
        fetches: std::sync::atomic::AtomicU32,
    }

    impl ScriptedSource {
        fn new(id: &str, script: Vec<Result<BTreeMap<String, f64>, SourceError>>) -> Self {
            Self {
                id: id.to_string(),
                script: StdMutex::new(script.into()),
                fetches: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MarketSource for ScriptedSource {
        fn source_id(&self) -> &str {
            &self.id
        }

        async fn fetch(&self, now_ts: u64) -> Result<MarketSnapshot, SourceError> {
            self.fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(SourceError::Timeout));
            next.map(|fields| MarketSnapshot {
                source_id: self.id.clone(),
                captured_at: now_ts,
                fields,
                stale: false,
            })
        }
    }

    fn fields(price: f64) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("price".to_string(), price);
        m
    }

    fn cached(script: Vec<Result<BTreeMap<String, f64>, SourceError>>) -> CachedSource {
        CachedSource::new(
            Box::new(ScriptedSource::new("feed-a", script)),
            30,
            Duration::from_millis(500),
            RetryPolicy { max_retries: 1, base_delay_ms: 1 },
        )
    }

    #[tokio::test]
    async fn test_poll_within_ttl_serves_cache() {
        let src = cached(vec![Ok(fields(100.0)), Ok(fields(200.0))]);
        let first = src.poll(1_000).await.unwrap();
        let second = src.poll(1_010).await.unwrap();
        assert_eq!(first.fields["price"], 100.0);
        // Second poll is inside the 30s TTL: cache hit, no second fetch.
        assert_eq!(second.fields["price"], 100.0);
    }

    #[tokio::test]
    async fn test_poll_refetches_after_ttl() {
        let src = cached(vec![Ok(fields(100.0)), Ok(fields(200.0))]);
        src.poll(1_000).await.unwrap();
        let later = src.poll(1_100).await.unwrap();
        assert_eq!(later.fields["price"], 200.0);
        assert!(!later.stale);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_stale_cache() {
        let src = cached(vec![
            Ok(fields(100.0)),
            Err(SourceError::AuthFailure),
        ]);
        src.poll(1_000).await.unwrap();
        let fallback = src.poll(1_100).await.unwrap();
        assert!(fallback.stale);
        assert_eq!(fallback.fields["price"], 100.0);
    }

    #[tokio::test]
    async fn test_failure_without_cache_propagates() {
        let src = cached(vec![Err(SourceError::AuthFailure)]);
        let err = src.poll(1_000).await.unwrap_err();
        assert_eq!(err, SourceError::AuthFailure);
    }

    #[tokio::test]
    async fn test_transient_error_retried_bounded() {
        let inner = ScriptedSource::new(
            "feed-a",
            vec![Err(SourceError::RateLimited), Ok(fields(42.0))],
        );
        let src = CachedSource::new(
            Box::new(inner),
            30,
            Duration::from_millis(500),
            RetryPolicy { max_retries: 1, base_delay_ms: 1 },
        );
        let snap = src.poll(1_000).await.unwrap();
        assert_eq!(snap.fields["price"], 42.0);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let src = cached(vec![Err(SourceError::Malformed("bad json".to_string()))]);
        let err = src.poll(1_000).await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_pollers_coalesce() {
        let src = Arc::new(cached(vec![Ok(fields(100.0)), Ok(fields(999.0))]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let src = Arc::clone(&src);
            handles.push(tokio::spawn(async move { src.poll(1_000).await }));
        }
        for h in handles {
            let snap = h.await.unwrap().unwrap();
            // All callers see the single-flight result, never the second fetch.
            assert_eq!(snap.fields["price"], 100.0);
        }
    }

    #[tokio::test]
    async fn test_poll_all_isolates_failures() {
        let ok = Arc::new(cached(vec![Ok(fields(1.0))]));
        let bad = Arc::new(cached(vec![Err(SourceError::AuthFailure)]));
        let results = poll_all(&[ok, bad], 1_000).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
    }
}
