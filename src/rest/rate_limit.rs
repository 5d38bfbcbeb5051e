// =============================================================================
// REST rate limiting - one token bucket per exchange quota pool
// =============================================================================
//
// Every REST call goes through `RateLimiterRegistry::acquire`, which:
//   1. waits out any pool-wide pause set after a 429 / rate-limit response,
//   2. waits for a `governor` token from the pool's bucket.
//
// Binance additionally reports the weight used in the current minute through
// the `X-MBX-USED-WEIGHT-1M` header; `WeightTracker` keeps that in atomics and
// the client pauses the pool when it nears the exchange ceiling.
// =============================================================================

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::exchanges::{ExchangeAdapter, RateQuota};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const FALLBACK_QUOTA: NonZeroU32 = NonZeroU32::MIN;

// =============================================================================
// Weight tracker (Binance used-weight header)
// =============================================================================

/// Soft warning threshold, as a share of the hard limit.
const WEIGHT_WARN_RATIO: f64 = 0.8;

/// Thread-safe request-weight tracker backed by an atomic counter.
pub struct WeightTracker {
    used_weight_1m: AtomicU32,
    hard_limit: u32,
}

/// Serialisable view of the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl WeightTracker {
    pub fn new(hard_limit: u32) -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            hard_limit,
        }
    }

    fn warn_threshold(&self) -> u32 {
        (self.hard_limit as f64 * WEIGHT_WARN_RATIO) as u32
    }

    /// Update the counter from the `X-MBX-USED-WEIGHT-1M` response header.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record(w);
    }

    pub fn record(&self, used: u32) {
        let prev = self.used_weight_1m.swap(used, Ordering::Relaxed);
        let warn_at = self.warn_threshold();
        if used >= warn_at && prev < warn_at {
            warn!(
                used_weight = used,
                hard_limit = self.hard_limit,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = used, "rate-limit weight updated from header");
    }

    /// Whether `weight` more can be spent without crossing the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        current + weight <= self.hard_limit
    }

    /// Reset at the start of a new minute.
    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WeightSnapshot {
        WeightSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            hard_limit: self.hard_limit,
        }
    }
}

impl std::fmt::Debug for WeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("hard_limit", &self.hard_limit)
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

struct Pool {
    limiter: DirectLimiter,
    paused_until: RwLock<Option<Instant>>,
}

/// Shared token buckets keyed by [`ExchangeAdapter::rate_pool`].
#[derive(Default)]
pub struct RateLimiterRegistry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn quota_for(q: RateQuota) -> Quota {
        let burst = NonZeroU32::new(q.requests).unwrap_or(FALLBACK_QUOTA);
        let period = q.per / burst.get();
        Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst)
    }

    fn pool(&self, adapter: &dyn ExchangeAdapter) -> Arc<Pool> {
        let key = adapter.rate_pool();
        if let Some(pool) = self.pools.read().get(&key) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Pool {
                    limiter: RateLimiter::direct(Self::quota_for(adapter.quota())),
                    paused_until: RwLock::new(None),
                })
            })
            .clone()
    }

    /// Wait until one request may be sent on the adapter's pool.
    pub async fn acquire(&self, adapter: &dyn ExchangeAdapter) {
        let pool = self.pool(adapter);
        loop {
            let until = *pool.paused_until.read();
            match until {
                Some(t) if t > Instant::now() => tokio::time::sleep_until(t).await,
                _ => break,
            }
        }
        pool.limiter.until_ready().await;
    }

    /// Pause every caller of the adapter's pool for `duration`.
    pub fn pause(&self, adapter: &dyn ExchangeAdapter, duration: Duration) {
        let pool = self.pool(adapter);
        let until = Instant::now() + duration;
        let mut slot = pool.paused_until.write();
        if slot.map_or(true, |current| current < until) {
            *slot = Some(until);
        }
        warn!(
            pool = %adapter.rate_pool(),
            pause_ms = duration.as_millis() as u64,
            "rest pool paused after rate-limit response"
        );
    }

    /// Remaining pause for the adapter's pool, if any.
    pub fn paused_for(&self, adapter: &dyn ExchangeAdapter) -> Option<Duration> {
        let pool = self.pool(adapter);
        let until = (*pool.paused_until.read())?;
        until.checked_duration_since(Instant::now())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::adapter_for;
    use crate::types::{ExchangeId, MarketType};

    #[test]
    fn weight_tracker_blocks_near_limit() {
        let t = WeightTracker::new(1000);
        t.record(990);
        assert!(t.can_send_request(10));
        assert!(!t.can_send_request(11));
        t.reset_1m_weight();
        assert_eq!(t.snapshot().used_weight_1m, 0);
    }

    #[test]
    fn weight_header_is_parsed() {
        let t = WeightTracker::new(1000);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", "42".parse().unwrap());
        t.update_from_headers(&headers);
        assert_eq!(t.snapshot().used_weight_1m, 42);
    }

    #[test]
    fn bybit_categories_share_one_pool() {
        let reg = RateLimiterRegistry::new();
        let spot = adapter_for(ExchangeId::Bybit, MarketType::Spot);
        let linear = adapter_for(ExchangeId::Bybit, MarketType::Linear);
        reg.pause(spot.as_ref(), Duration::from_secs(5));
        assert!(reg.paused_for(linear.as_ref()).is_some());

        let binance = adapter_for(ExchangeId::Binance, MarketType::Spot);
        assert!(reg.paused_for(binance.as_ref()).is_none());
    }

    #[tokio::test]
    async fn acquire_within_burst_is_immediate() {
        let reg = RateLimiterRegistry::new();
        let okx = adapter_for(ExchangeId::Okx, MarketType::Spot);
        let started = std::time::Instant::now();
        for _ in 0..5 {
            reg.acquire(okx.as_ref()).await;
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn acquire_waits_out_a_pause() {
        let reg = RateLimiterRegistry::new();
        let okx = adapter_for(ExchangeId::Okx, MarketType::Spot);
        reg.pause(okx.as_ref(), Duration::from_millis(50));
        let started = std::time::Instant::now();
        reg.acquire(okx.as_ref()).await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
