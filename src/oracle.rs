// src/oracle.rs
//! JPY/USD exchange rate from the Chainlink feed on Ethereum mainnet, cached
//! for one minute and degraded to a stale or fallback value when the feed is
//! unreachable.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::types::{Address, H160, U256};
use ethers::utils::format_units;
use serde::Serialize;
use tracing::{debug, warn};

use crate::authorization::unix_now;
use crate::error::FacilitatorError;

// Chainlink JPY/USD on mainnet: 0xBcE206caE7f0ec07b545EddE332A47C2F75bbeb3
pub const JPY_USD_FEED_ADDRESS: Address = H160([
    0xbc, 0xe2, 0x06, 0xca, 0xe7, 0xf0, 0xec, 0x07, 0xb5, 0x45, 0xed, 0xde, 0x33, 0x2a, 0x47,
    0xc2, 0xf7, 0x5b, 0xbe, 0xb3,
]);

pub const CACHE_TTL: Duration = Duration::from_secs(60);
pub const FEED_TIMEOUT: Duration = Duration::from_secs(10);
pub const FALLBACK_JPY_PER_USD: f64 = 150.0;

/// Raw oracle answer, denominated in USD per JPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRound {
    pub answer: U256,
    pub decimals: u8,
    pub updated_at: u64,
}

#[async_trait]
pub trait RateFeed: Send + Sync {
    async fn latest(&self) -> Result<FeedRound, FacilitatorError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    /// JPY per 1 USD.
    pub rate: f64,
    /// Unix seconds of the oracle update (or of the fallback).
    pub observed_at: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    snapshot: PriceSnapshot,
    fetched_at: Instant,
}

pub struct PriceOracleCache {
    feed: Arc<dyn RateFeed>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    fallback_rate: f64,
    cached: RwLock<Option<CachedRate>>,
}

impl PriceOracleCache {
    pub fn new(feed: Arc<dyn RateFeed>, clock: Arc<dyn Clock>) -> Self {
        Self {
            feed,
            clock,
            ttl: CACHE_TTL,
            fallback_rate: FALLBACK_JPY_PER_USD,
            cached: RwLock::new(None),
        }
    }

    /// Current JPY per USD. Never fails: on feed errors the last known rate
    /// (or the fallback) is returned with `stale` set.
    pub async fn rate(&self) -> PriceSnapshot {
        let now = self.clock.now();
        let previous = self.read_cached();

        if let Some(entry) = previous {
            if now.duration_since(entry.fetched_at) < self.ttl {
                return entry.snapshot;
            }
        }

        match self.fetch().await {
            Ok(snapshot) => {
                debug!(jpy_per_usd = snapshot.rate, "Refreshed oracle rate");
                // Concurrent refreshes race here; the last writer wins
                if let Ok(mut guard) = self.cached.write() {
                    *guard = Some(CachedRate {
                        snapshot,
                        fetched_at: now,
                    });
                }
                snapshot
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch oracle price, using fallback");
                match previous {
                    Some(entry) => PriceSnapshot {
                        stale: true,
                        ..entry.snapshot
                    },
                    None => PriceSnapshot {
                        rate: self.fallback_rate,
                        observed_at: unix_now(),
                        stale: true,
                    },
                }
            }
        }
    }

    fn read_cached(&self) -> Option<CachedRate> {
        self.cached.read().ok().and_then(|guard| *guard)
    }

    async fn fetch(&self) -> Result<PriceSnapshot, FacilitatorError> {
        let round = self.feed.latest().await?;

        // The feed quotes USD per JPY; pricing needs JPY per USD
        let usd_per_jpy = format_units(round.answer, u32::from(round.decimals))
            .map_err(|e| FacilitatorError::UpstreamUnavailable(e.to_string()))?
            .parse::<f64>()
            .map_err(|e| FacilitatorError::UpstreamUnavailable(e.to_string()))?;

        if usd_per_jpy <= 0.0 || !usd_per_jpy.is_finite() {
            return Err(FacilitatorError::UpstreamUnavailable(format!(
                "unusable oracle answer {}",
                usd_per_jpy
            )));
        }

        Ok(PriceSnapshot {
            rate: 1.0 / usd_per_jpy,
            observed_at: round.updated_at,
            stale: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Clock advanced by hand.
    pub(crate) struct ManualClock {
        origin: Instant,
        offset_ms: AtomicU64,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset_ms: AtomicU64::new(0),
            }
        }

        pub(crate) fn advance(&self, by: Duration) {
            self.offset_ms
                .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.origin + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
        }
    }

    /// Feed answering a fixed round, or failing when switched off.
    pub(crate) struct StubFeed {
        pub(crate) answer: AtomicU64,
        pub(crate) healthy: AtomicBool,
        pub(crate) calls: AtomicUsize,
    }

    impl StubFeed {
        pub(crate) fn new(answer: u64) -> Self {
            Self {
                answer: AtomicU64::new(answer),
                healthy: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            let feed = Self::new(0);
            feed.healthy.store(false, Ordering::SeqCst);
            feed
        }
    }

    #[async_trait]
    impl RateFeed for StubFeed {
        async fn latest(&self) -> Result<FeedRound, FacilitatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(FacilitatorError::UpstreamUnavailable("feed down".into()));
            }
            Ok(FeedRound {
                answer: U256::from(self.answer.load(Ordering::SeqCst)),
                decimals: 8,
                updated_at: 1_700_000_000,
            })
        }
    }

    fn cache_with(feed: Arc<StubFeed>, clock: Arc<ManualClock>) -> PriceOracleCache {
        PriceOracleCache::new(feed, clock)
    }

    #[tokio::test]
    async fn test_inverts_usd_per_jpy() {
        // 0.005 USD per JPY
        let feed = Arc::new(StubFeed::new(500_000));
        let cache = cache_with(feed, Arc::new(ManualClock::new()));

        let snapshot = cache.rate().await;
        assert!((snapshot.rate - 200.0).abs() < 1e-9);
        assert_eq!(snapshot.observed_at, 1_700_000_000);
        assert!(!snapshot.stale);
    }

    #[tokio::test]
    async fn test_serves_identical_value_within_ttl() {
        let feed = Arc::new(StubFeed::new(500_000));
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(feed.clone(), clock.clone());

        let first = cache.rate().await;
        feed.answer.store(400_000, Ordering::SeqCst);

        for _ in 0..5 {
            clock.advance(Duration::from_secs(11));
            assert_eq!(cache.rate().await, first);
        }
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refreshes_once_ttl_elapses() {
        let feed = Arc::new(StubFeed::new(500_000));
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(feed.clone(), clock.clone());

        cache.rate().await;
        feed.answer.store(400_000, Ordering::SeqCst);

        clock.advance(Duration::from_millis(59_999));
        assert!((cache.rate().await.rate - 200.0).abs() < 1e-9);

        clock.advance(Duration::from_millis(1));
        let refreshed = cache.rate().await;
        assert!((refreshed.rate - 250.0).abs() < 1e-9);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_returns_previous_value_as_stale() {
        let feed = Arc::new(StubFeed::new(500_000));
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(feed.clone(), clock.clone());

        let fresh = cache.rate().await;
        feed.healthy.store(false, Ordering::SeqCst);
        clock.advance(Duration::from_secs(3600));

        let degraded = cache.rate().await;
        assert!(degraded.stale);
        assert_eq!(degraded.rate, fresh.rate);
        assert_eq!(degraded.observed_at, fresh.observed_at);
    }

    #[tokio::test]
    async fn test_failure_without_cache_uses_fallback() {
        let cache = cache_with(Arc::new(StubFeed::failing()), Arc::new(ManualClock::new()));

        let snapshot = cache.rate().await;
        assert_eq!(snapshot.rate, FALLBACK_JPY_PER_USD);
        assert!(snapshot.stale);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_retried_on_next_call() {
        let feed = Arc::new(StubFeed::failing());
        let cache = cache_with(feed.clone(), Arc::new(ManualClock::new()));

        cache.rate().await;
        feed.answer.store(500_000, Ordering::SeqCst);
        feed.healthy.store(true, Ordering::SeqCst);

        let snapshot = cache.rate().await;
        assert!(!snapshot.stale);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_on_cold_cache() {
        let feed = Arc::new(StubFeed::new(500_000));
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(cache_with(feed.clone(), clock.clone()));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.rate().await })
            })
            .collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.await.unwrap());
        }

        for snapshot in &snapshots {
            assert!(!snapshot.stale);
            assert!((snapshot.rate - 200.0).abs() < 1e-9);
            assert_eq!(snapshot.observed_at, 1_700_000_000);
        }
        let calls = feed.calls.load(Ordering::SeqCst);
        assert!((1..=50).contains(&calls));

        // Whichever refresh wrote last is served unchanged within the TTL
        feed.answer.store(400_000, Ordering::SeqCst);
        clock.advance(Duration::from_secs(30));
        let cached = cache.rate().await;
        assert_eq!(cached, snapshots[0]);
        assert_eq!(cache.rate().await, cached);
        assert_eq!(feed.calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn test_feed_address_constant() {
        let expected: Address = "0xBcE206caE7f0ec07b545EddE332A47C2F75bbeb3".parse().unwrap();
        assert_eq!(JPY_USD_FEED_ADDRESS, expected);
    }
}
