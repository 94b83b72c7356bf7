//! In-memory counter store for the reference counting service.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::backend::CounterBackend;
use super::counter::FixedWindowCounter;
use crate::grpc::proto::rate_limit_response::{Code, DescriptorStatus};
use crate::grpc::proto::RateLimitDescriptor;
use crate::grpc::{duration_from_proto, duration_to_proto};
use crate::ratelimit::Descriptor;

/// Key identifying a counter in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The rate limit domain.
    pub domain: String,
    /// The descriptor entries, compared structurally.
    pub descriptor: Descriptor,
    /// The window length; different windows count separately.
    pub window: Duration,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(domain: &str, descriptor: &Descriptor, window: Duration) -> Self {
        Self {
            domain: domain.to_string(),
            descriptor: descriptor.clone(),
            window,
        }
    }
}

/// Fixed-window counters held in process memory.
///
/// This struct is thread-safe and can be shared across request tasks.
#[derive(Debug, Default)]
pub struct CounterStore {
    counters: DashMap<CounterKey, FixedWindowCounter>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for a descriptor, if a counter exists.
    pub fn get_count(&self, domain: &str, descriptor: &Descriptor, window: Duration) -> Option<u64> {
        let key = CounterKey::new(domain, descriptor, window);
        self.counters.get(&key).map(|c| c.current_count())
    }

    /// Get the number of active counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop counters whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired_at(now));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired counters");
        }
        removed
    }
}

#[async_trait]
impl CounterBackend for CounterStore {
    async fn check_rate_limit(
        &self,
        domain: &str,
        descriptor: &RateLimitDescriptor,
        hits: u32,
    ) -> DescriptorStatus {
        let unusable = DescriptorStatus {
            code: Code::Unknown.into(),
            ..Default::default()
        };
        let Some(limit) = descriptor.limit.clone() else {
            return unusable;
        };
        let window = limit
            .window
            .as_ref()
            .map(duration_from_proto)
            .unwrap_or_default();
        if window.is_zero() {
            return unusable;
        }
        let descriptor = Descriptor::from(descriptor);
        let key = CounterKey::new(domain, &descriptor, window);

        let (count, until_reset) = self
            .counters
            .entry(key)
            .or_insert_with(|| {
                debug!(
                    domain = %domain,
                    descriptor = %descriptor,
                    window_ms = window.as_millis() as u64,
                    "Creating new counter"
                );
                FixedWindowCounter::new(window)
            })
            .increment(hits as u64);

        let allowed = limit.requests_per_unit as u64;
        let code = if count <= allowed {
            Code::Ok
        } else {
            Code::OverLimit
        };

        trace!(
            domain = %domain,
            descriptor = %descriptor,
            count = count,
            limit = allowed,
            code = ?code,
            "Counted descriptor"
        );

        DescriptorStatus {
            code: code.into(),
            current_limit: Some(limit),
            limit_remaining: allowed.saturating_sub(count) as u32,
            duration_until_reset: Some(duration_to_proto(until_reset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::proto::{rate_limit_descriptor::Entry, RateLimit};

    fn descriptor(value: &str, requests: u32, window: Duration) -> RateLimitDescriptor {
        RateLimitDescriptor {
            entries: vec![Entry {
                key: "route".to_string(),
                value: value.to_string(),
            }],
            limit: Some(RateLimit {
                requests_per_unit: requests,
                window: Some(duration_to_proto(window)),
                name: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn test_counts_up_to_limit() {
        let store = CounterStore::new();
        let d = descriptor("/api", 5, Duration::from_secs(60));

        for i in 1..=5 {
            let status = store.check_rate_limit("mesh", &d, 1).await;
            assert_eq!(status.code(), Code::Ok, "request {} should be OK", i);
            assert_eq!(status.limit_remaining, 5 - i);
        }

        let status = store.check_rate_limit("mesh", &d, 1).await;
        assert_eq!(status.code(), Code::OverLimit);
        assert_eq!(status.limit_remaining, 0);
        assert!(status.duration_until_reset.is_some());
    }

    #[tokio::test]
    async fn test_domains_and_windows_count_separately() {
        let store = CounterStore::new();
        let minute = descriptor("/api", 10, Duration::from_secs(60));
        let hour = descriptor("/api", 10, Duration::from_secs(3600));

        store.check_rate_limit("a", &minute, 5).await;
        store.check_rate_limit("b", &minute, 3).await;
        store.check_rate_limit("a", &hour, 2).await;

        let key = Descriptor::from(&minute);
        assert_eq!(store.get_count("a", &key, Duration::from_secs(60)), Some(5));
        assert_eq!(store.get_count("b", &key, Duration::from_secs(60)), Some(3));
        assert_eq!(store.get_count("a", &key, Duration::from_secs(3600)), Some(2));
        assert_eq!(store.counter_count(), 3);
    }

    #[tokio::test]
    async fn test_separator_characters_do_not_alias_descriptors() {
        let store = CounterStore::new();
        let limit = Some(RateLimit {
            requests_per_unit: 1,
            window: Some(duration_to_proto(Duration::from_secs(60))),
            name: String::new(),
        });
        let entry = |key: &str, value: &str| Entry {
            key: key.to_string(),
            value: value.to_string(),
        };
        let crafted = RateLimitDescriptor {
            entries: vec![entry("user", "alice,route=/api")],
            limit: limit.clone(),
        };
        let genuine = RateLimitDescriptor {
            entries: vec![entry("user", "alice"), entry("route", "/api")],
            limit,
        };

        assert_eq!(store.check_rate_limit("mesh", &crafted, 1).await.code(), Code::Ok);
        assert_eq!(store.check_rate_limit("mesh", &genuine, 1).await.code(), Code::Ok);
        assert_eq!(store.counter_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_limit_reports_unknown() {
        let store = CounterStore::new();
        let mut d = descriptor("/api", 1, Duration::from_secs(1));
        d.limit = None;

        let status = store.check_rate_limit("mesh", &d, 1).await;
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = CounterStore::new();
        store
            .check_rate_limit("mesh", &descriptor("/short", 1, Duration::from_millis(20)), 1)
            .await;
        store
            .check_rate_limit("mesh", &descriptor("/long", 1, Duration::from_secs(3600)), 1)
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.counter_count(), 1);
    }
}
