//! Fixed-window rate limiting keyed by client and target.
//!
//! The counter store sits behind [`RateLimitStore`] so the in-process map can be
//! replaced by a shared store without touching the pipeline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;

/// `(client IP, hash of target URL)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub client_ip: IpAddr,
    pub target_hash: u64,
}

impl RateLimitKey {
    pub fn new(client_ip: IpAddr, target_url: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        target_url.hash(&mut hasher);
        Self {
            client_ip,
            target_hash: hasher.finish(),
        }
    }
}

/// Requests counted in the window that started at `window_start`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitCounter {
    pub count: u32,
    pub window_start: Instant,
}

/// Result of one check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

/// Shared counter storage. Implementations must make check-and-increment atomic per key.
pub trait RateLimitStore: Send + Sync {
    fn check_and_increment(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateDecision;

    /// Drop counters whose window has elapsed. Returns how many were removed.
    fn evict_expired(&self, window: Duration, now: Instant) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-process store. The per-key entry lock makes increments atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    counters: DashMap<RateLimitKey, RateLimitCounter>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryStore {
    fn check_and_increment(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        let mut entry = self.counters.entry(*key).or_insert(RateLimitCounter {
            count: 0,
            window_start: now,
        });
        let counter = entry.value_mut();

        // Lazy reset: an elapsed window starts over on next access.
        if now.saturating_duration_since(counter.window_start) >= window {
            counter.count = 0;
            counter.window_start = now;
        }
        let reset_after = window.saturating_sub(now.saturating_duration_since(counter.window_start));

        if counter.count >= limit {
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_after,
            };
        }

        counter.count += 1;
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - counter.count,
            reset_after,
        }
    }

    fn evict_expired(&self, window: Duration, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| now.saturating_duration_since(counter.window_start) < window);
        before.saturating_sub(self.counters.len())
    }

    fn len(&self) -> usize {
        self.counters.len()
    }
}

/// Applies the configured budget on top of a store.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    enabled: bool,
    limit: u32,
    window: Duration,
    eviction_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            enabled: config.enabled,
            limit: config.max_requests,
            window: Duration::from_secs(config.window_secs),
            eviction_interval: Duration::from_secs(config.eviction_interval_secs),
        }
    }

    pub fn check_and_increment(&self, key: &RateLimitKey) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &RateLimitKey, now: Instant) -> RateDecision {
        if !self.enabled {
            return RateDecision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit,
                reset_after: Duration::ZERO,
            };
        }
        self.store.check_and_increment(key, self.limit, self.window, now)
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Periodically evict stale counters until shutdown is signalled.
    pub fn spawn_eviction(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.eviction_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.store.evict_expired(self.window, Instant::now());
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = self.store.len(), "Evicted stale rate-limit counters");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Rate-limit eviction stopped");
                        break;
                    }
                }
            }
        })
    }
}
