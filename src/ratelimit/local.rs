//! In-process token bucket engine.
//!
//! Buckets live in a sharded LRU map. The shard lock is only held to find or
//! insert a bucket; the token update happens under the bucket's own lock, so
//! checks against different descriptors never contend on token arithmetic and
//! map maintenance never waits on a bucket.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};
use super::descriptor::DescriptorKey;
use super::verdict::{Quota, Verdict};
use crate::config::LocalConfig;
use crate::policy::Limit;

type Shard = Mutex<LruCache<DescriptorKey, Arc<Mutex<TokenBucket>>>>;

/// Local token bucket engine.
///
/// This struct is thread-safe and can be shared across request tasks.
pub struct LocalBucketEngine {
    shards: Box<[Shard]>,
    hasher: RandomState,
    clock: Arc<dyn Clock>,
}

impl LocalBucketEngine {
    /// Create an engine using the system clock.
    pub fn new(config: &LocalConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine reading time from `clock`.
    pub fn with_clock(config: &LocalConfig, clock: Arc<dyn Clock>) -> Self {
        // Per-shard caps must sum to at most max_buckets
        let shard_count = config.shards.clamp(1, config.max_buckets.max(1));
        let per_shard = (config.max_buckets / shard_count).max(1);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            clock,
        }
    }

    fn shard(&self, key: &DescriptorKey) -> &Shard {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Check and consume one token for `key`.
    pub fn check(&self, key: &DescriptorKey, limit: &Limit) -> Verdict {
        self.check_at(key, limit, self.clock.now())
    }

    /// Check and consume one token for `key` as of `now`.
    pub fn check_at(&self, key: &DescriptorKey, limit: &Limit, now: Instant) -> Verdict {
        let bucket = self.bucket(key, limit, now);
        let mut bucket = bucket.lock();
        bucket.reconfigure(limit);

        let result = bucket.try_acquire(now);
        let quota = Quota {
            limit: limit.requests,
            window: limit.window,
            remaining: *result.as_ref().unwrap_or(&0),
            reset_after: bucket.time_to_full(),
        };

        match result {
            Ok(remaining) => {
                trace!(key = %key, remaining = remaining, "Local bucket admitted");
                Verdict::admit().with_quota(quota)
            }
            Err(retry_after) => {
                debug!(
                    key = %key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Local bucket exhausted"
                );
                Verdict::deny(Some(retry_after)).with_quota(quota)
            }
        }
    }

    fn bucket(&self, key: &DescriptorKey, limit: &Limit, now: Instant) -> Arc<Mutex<TokenBucket>> {
        let mut shard = self.shard(key).lock();
        if let Some(bucket) = shard.get(key) {
            return Arc::clone(bucket);
        }

        debug!(
            key = %key,
            capacity = limit.capacity(),
            refill_rate = limit.refill_rate(),
            "Creating new token bucket"
        );
        let bucket = Arc::new(Mutex::new(TokenBucket::new(limit, now)));
        if let Some((evicted, _)) = shard.push(key.clone(), Arc::clone(&bucket)) {
            if &evicted != key {
                debug!(key = %evicted, "Evicted least recently used token bucket");
            }
        }
        bucket
    }

    /// Number of buckets currently held.
    pub fn bucket_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether a bucket exists for `key`, without touching its recency.
    pub fn contains(&self, key: &DescriptorKey) -> bool {
        self.shard(key).lock().contains(key)
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }
}
