//! Bucket storage keyed by rate limit key.
//!
//! Both backings make lookup-or-create atomic: concurrent first requests
//! for a new key observe the same bucket.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;

use super::bucket::Bucket;
use super::key::RateLimitKey;
use crate::error::{Result, TollgateError};

/// Storage for per-key buckets.
pub trait BucketStore: Send + Sync + Debug {
    /// Run `f` with exclusive access to the bucket for `key`, creating it
    /// with `init` on first sight.
    ///
    /// Calls for the same key are linearized.
    fn with_bucket<R>(
        &self,
        key: &RateLimitKey,
        init: impl FnOnce() -> Bucket,
        f: impl FnOnce(&mut Bucket) -> R,
    ) -> Result<R>;

    /// Snapshot of the bucket for `key`, if one exists.
    fn get(&self, key: &RateLimitKey) -> Option<Bucket>;

    /// Number of tracked keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every bucket.
    fn clear(&self);
}

/// Which [`BucketStore`] backs a limiter built from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Sharded map, per-shard locking
    #[default]
    Sharded,
    /// Single lock over all keys
    GlobalLock,
}

/// Sharded concurrent store backed by DashMap.
///
/// Keys in different shards never contend.
#[derive(Debug, Default)]
pub struct ShardedBucketStore {
    buckets: DashMap<RateLimitKey, Bucket>,
}

impl ShardedBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketStore for ShardedBucketStore {
    fn with_bucket<R>(
        &self,
        key: &RateLimitKey,
        init: impl FnOnce() -> Bucket,
        f: impl FnOnce(&mut Bucket) -> R,
    ) -> Result<R> {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return Ok(f(&mut *bucket));
        }

        // Another caller may insert between the miss above and here;
        // the entry API keeps whichever bucket landed first.
        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(init);
        Ok(f(&mut *bucket))
    }

    fn get(&self, key: &RateLimitKey) -> Option<Bucket> {
        self.buckets.get(key).map(|bucket| *bucket)
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }

    fn clear(&self) {
        self.buckets.clear();
    }
}

/// Store guarded by one lock across all keys.
///
/// Simple and correct, but every evaluation serializes on the same lock.
#[derive(Debug, Default)]
pub struct LockedBucketStore {
    buckets: Mutex<HashMap<RateLimitKey, Bucket>>,
}

impl LockedBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketStore for LockedBucketStore {
    fn with_bucket<R>(
        &self,
        key: &RateLimitKey,
        init: impl FnOnce() -> Bucket,
        f: impl FnOnce(&mut Bucket) -> R,
    ) -> Result<R> {
        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(key) {
            buckets.insert(key.clone(), init());
        }
        let bucket = buckets
            .get_mut(key)
            .ok_or_else(|| TollgateError::Store(format!("bucket for {} vanished under lock", key)))?;
        Ok(f(bucket))
    }

    fn get(&self, key: &RateLimitKey) -> Option<Bucket> {
        self.buckets.lock().get(key).copied()
    }

    fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    fn clear(&self) {
        self.buckets.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Instant;

    fn exercise_lazy_creation<S: BucketStore>(store: S) {
        let key = RateLimitKey::from("usr_1");
        let now = Instant::now();
        assert!(store.get(&key).is_none());

        let tokens = store
            .with_bucket(&key, || Bucket::empty(now), |bucket| bucket.tokens)
            .unwrap();
        assert_eq!(tokens, 0.0);
        assert_eq!(store.len(), 1);

        store
            .with_bucket(&key, || panic!("bucket already exists"), |bucket| bucket.tokens = 4.0)
            .unwrap();
        assert_eq!(store.get(&key).unwrap().tokens, 4.0);

        store.clear();
        assert!(store.is_empty());
    }

    fn exercise_first_access_race<S: BucketStore>(store: S) {
        const CALLERS: usize = 16;
        let key = RateLimitKey::from("contended");
        let now = Instant::now();
        let created = AtomicUsize::new(0);
        let barrier = Barrier::new(CALLERS);

        std::thread::scope(|scope| {
            for _ in 0..CALLERS {
                scope.spawn(|| {
                    barrier.wait();
                    store
                        .with_bucket(
                            &key,
                            || {
                                created.fetch_add(1, Ordering::SeqCst);
                                Bucket::empty(now)
                            },
                            |bucket| bucket.tokens += 1.0,
                        )
                        .unwrap();
                });
            }
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key).unwrap().tokens, CALLERS as f64);
    }

    #[test]
    fn test_sharded_store_lazy_creation() {
        exercise_lazy_creation(ShardedBucketStore::new());
    }

    #[test]
    fn test_locked_store_lazy_creation() {
        exercise_lazy_creation(LockedBucketStore::new());
    }

    #[test]
    fn test_sharded_store_first_access_race() {
        exercise_first_access_race(ShardedBucketStore::new());
    }

    #[test]
    fn test_locked_store_first_access_race() {
        exercise_first_access_race(LockedBucketStore::new());
    }

    #[test]
    fn test_distinct_keys_have_separate_buckets() {
        let store = ShardedBucketStore::new();
        let now = Instant::now();

        store
            .with_bucket(&"a".into(), || Bucket::empty(now), |b| b.tokens = 1.0)
            .unwrap();
        store
            .with_bucket(&"b".into(), || Bucket::empty(now), |b| b.tokens = 2.0)
            .unwrap();

        assert_eq!(store.get(&"a".into()).unwrap().tokens, 1.0);
        assert_eq!(store.get(&"b".into()).unwrap().tokens, 2.0);
        assert_eq!(store.len(), 2);
    }
}
