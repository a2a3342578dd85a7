//! Rate Limiter
//!
//! Token buckets per `(tenant, window)` and `(tenant, recipient, window)` at
//! minute/hour/day windows. `try_acquire` is all-or-nothing: it succeeds only
//! if every referenced bucket has a token, and consumes from all of them in
//! one atomic step. Buckets refill continuously at `capacity / window`.
//!
//! Consulted by the orchestrator before enqueueing; a rejection becomes a
//! `RateLimited` outcome, never a retry.

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

use nx_config::RateLimitOptions;

/// Rate-limit windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn seconds(&self) -> f64 {
        match self {
            Window::Minute => 60.0,
            Window::Hour => 3_600.0,
            Window::Day => 86_400.0,
        }
    }
}

/// Key addressing one token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LimitScope {
    Tenant { tenant_id: String },
    Recipient { tenant_id: String, recipient_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub scope: LimitScope,
    pub window: Window,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, window: Window) -> Self {
        let capacity = capacity as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / window.seconds(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Counters for the stats surface.
#[derive(Debug, Default)]
struct LimiterCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub accepted: u64,
    pub rejected: u64,
    pub active_buckets: usize,
}

pub struct RateLimiter {
    options: RateLimitOptions,
    // single lock: all-or-nothing consumption needs every bucket at once
    buckets: Mutex<HashMap<LimitKey, Bucket>>,
    counters: LimiterCounters,
}

impl RateLimiter {
    pub fn new(options: RateLimitOptions) -> Self {
        Self {
            options,
            buckets: Mutex::new(HashMap::new()),
            counters: LimiterCounters::default(),
        }
    }

    /// The standard key set for one ingest: tenant buckets plus one recipient
    /// bucket set per recipient. Windows with a zero capacity are skipped.
    pub fn keys_for(&self, tenant_id: &str, recipient_ids: &[&str]) -> Vec<LimitKey> {
        let mut keys = Vec::new();
        let tenant_limits = [
            (Window::Minute, self.options.tenant_per_minute),
            (Window::Hour, self.options.tenant_per_hour),
            (Window::Day, self.options.tenant_per_day),
        ];
        for (window, capacity) in tenant_limits {
            if capacity > 0 {
                keys.push(LimitKey {
                    scope: LimitScope::Tenant { tenant_id: tenant_id.to_string() },
                    window,
                });
            }
        }
        let recipient_limits = [
            (Window::Minute, self.options.recipient_per_minute),
            (Window::Hour, self.options.recipient_per_hour),
            (Window::Day, self.options.recipient_per_day),
        ];
        for recipient_id in recipient_ids {
            for (window, capacity) in recipient_limits {
                if capacity > 0 {
                    keys.push(LimitKey {
                        scope: LimitScope::Recipient {
                            tenant_id: tenant_id.to_string(),
                            recipient_id: recipient_id.to_string(),
                        },
                        window,
                    });
                }
            }
        }
        keys
    }

    /// All-or-nothing acquire: true only if every bucket has a token, in
    /// which case one token is consumed from each.
    pub fn try_acquire(&self, keys: &[LimitKey]) -> bool {
        if keys.is_empty() {
            return true;
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        for key in keys {
            let bucket = buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::new(self.capacity_for(key), key.window));
            bucket.refill(now);
            if bucket.tokens < 1.0 {
                drop(buckets);
                self.counters.rejected.fetch_add(1, Ordering::SeqCst);
                counter!("nx_rate_limited_total").increment(1);
                debug!(?key, "Rate limit exceeded");
                return false;
            }
        }

        for key in keys {
            if let Some(bucket) = buckets.get_mut(key) {
                bucket.tokens -= 1.0;
            }
        }

        self.counters.accepted.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn capacity_for(&self, key: &LimitKey) -> u32 {
        match (&key.scope, key.window) {
            (LimitScope::Tenant { .. }, Window::Minute) => self.options.tenant_per_minute,
            (LimitScope::Tenant { .. }, Window::Hour) => self.options.tenant_per_hour,
            (LimitScope::Tenant { .. }, Window::Day) => self.options.tenant_per_day,
            (LimitScope::Recipient { .. }, Window::Minute) => self.options.recipient_per_minute,
            (LimitScope::Recipient { .. }, Window::Hour) => self.options.recipient_per_hour,
            (LimitScope::Recipient { .. }, Window::Day) => self.options.recipient_per_day,
        }
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            accepted: self.counters.accepted.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            active_buckets: self.buckets.lock().len(),
        }
    }

    /// Whether DLQ routing is configured for rejected events.
    pub fn dead_letter_on_reject(&self) -> bool {
        self.options.dead_letter_on_reject
    }
}
