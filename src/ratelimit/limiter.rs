//! Token bucket admission engine.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use super::backend::{Algorithm, Decision, RateLimiterBackend};
use super::bucket::Bucket;
use super::clock::{Clock, SystemClock};
use super::key::{KeyExtractor, RateLimitKey, Request, StrategyExtractor};
use super::sink::RejectionSink;
use super::store::{BucketStore, ShardedBucketStore};
use crate::error::{validate_capacity, validate_fill_rate, Result};

/// Key recorded for rejections whose key could not be extracted.
const UNRESOLVED_KEY: &str = "<unresolved>";

/// Verdict returned when the limiter itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through
    #[default]
    FailOpen,
    /// Reject the request and record it in the rejection sink
    FailClosed,
}

/// Per-key token bucket rate limiter.
///
/// Each key owns a bucket that refills at `fill_rate` tokens per second up
/// to `capacity`. A request is admitted while its bucket holds strictly more
/// than one token, and consumes one token when admitted.
///
/// This struct is thread-safe and can be shared across threads. Evaluations
/// for the same key are linearized by the store; configuration updates are
/// atomic per field.
pub struct TokenBucketLimiter<S = ShardedBucketStore, C = SystemClock> {
    store: S,
    clock: C,
    extractor: Box<dyn KeyExtractor>,
    sink: Arc<RejectionSink>,
    /// `f64` bit pattern of the fill rate
    fill_rate: AtomicU64,
    capacity: AtomicU64,
    failure_policy: FailurePolicy,
}

impl TokenBucketLimiter {
    /// Create a limiter keyed by user id, backed by a sharded store and
    /// the system clock.
    pub fn new(fill_rate: f64, capacity: u64) -> Result<Self> {
        validate_fill_rate(fill_rate)?;
        validate_capacity(capacity)?;

        Ok(Self {
            store: ShardedBucketStore::new(),
            clock: SystemClock,
            extractor: Box::new(StrategyExtractor::default()),
            sink: Arc::new(RejectionSink::new()),
            fill_rate: AtomicU64::new(fill_rate.to_bits()),
            capacity: AtomicU64::new(capacity),
            failure_policy: FailurePolicy::default(),
        })
    }
}

impl<S: BucketStore, C: Clock> TokenBucketLimiter<S, C> {
    /// Replace the bucket store. Existing buckets are not carried over.
    pub fn with_store<S2: BucketStore>(self, store: S2) -> TokenBucketLimiter<S2, C> {
        TokenBucketLimiter {
            store,
            clock: self.clock,
            extractor: self.extractor,
            sink: self.sink,
            fill_rate: self.fill_rate,
            capacity: self.capacity,
            failure_policy: self.failure_policy,
        }
    }

    /// Replace the time source.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> TokenBucketLimiter<S, C2> {
        TokenBucketLimiter {
            store: self.store,
            clock,
            extractor: self.extractor,
            sink: self.sink,
            fill_rate: self.fill_rate,
            capacity: self.capacity,
            failure_policy: self.failure_policy,
        }
    }

    /// Replace how requests map to buckets.
    pub fn with_key_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    /// Collect rejections in a shared sink.
    pub fn with_rejection_sink(mut self, sink: Arc<RejectionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Decide whether `request` may proceed.
    ///
    /// Store failures and panics raised while evaluating are contained here
    /// and resolved by the failure policy.
    pub fn is_allowed(&self, request: &Request) -> Decision {
        let key = match panic::catch_unwind(AssertUnwindSafe(|| self.extractor.extract(request))) {
            Ok(key) => key,
            Err(payload) => {
                return self.on_fault(None, request, panic_message(payload.as_ref()));
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(&key, request))) {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => self.on_fault(Some(&key), request, &err.to_string()),
            Err(payload) => self.on_fault(Some(&key), request, panic_message(payload.as_ref())),
        }
    }

    fn evaluate(&self, key: &RateLimitKey, request: &Request) -> Result<Decision> {
        let fill_rate = self.fill_rate();
        let capacity = self.capacity();
        // A new bucket is evaluated at its creation instant, so it gets no refill.
        let created_at = Cell::new(None);

        let admission = self.store.with_bucket(
            key,
            || {
                let now = self.clock.now();
                created_at.set(Some(now));
                debug!(key = %key, "Creating new bucket");
                Bucket::empty(now)
            },
            |bucket| {
                // Read inside the exclusive section so a key's timestamp
                // only moves forward.
                let now = created_at.get().unwrap_or_else(|| self.clock.now());
                let admission = bucket.try_acquire(now, fill_rate, capacity);
                if !admission.allowed {
                    self.sink.append(key, request);
                }
                admission
            },
        )?;

        trace!(
            key = %key,
            request_id = request.request_id,
            candidate_tokens = admission.candidate_tokens,
            allowed = admission.allowed,
            "Evaluated request"
        );

        if admission.allowed {
            Ok(Decision::allowed())
        } else {
            debug!(
                key = %key,
                request_id = request.request_id,
                candidate_tokens = admission.candidate_tokens,
                "Rate limit exceeded"
            );
            Ok(Decision::rate_limited())
        }
    }

    fn on_fault(&self, key: Option<&RateLimitKey>, request: &Request, cause: &str) -> Decision {
        let key_label = key.map(|k| k.as_str()).unwrap_or(UNRESOLVED_KEY);
        error!(
            key = %key_label,
            request_id = request.request_id,
            policy = ?self.failure_policy,
            cause = %cause,
            "Rate limiter fault"
        );

        match self.failure_policy {
            FailurePolicy::FailOpen => Decision::unavailable(true),
            FailurePolicy::FailClosed => {
                let key = key
                    .cloned()
                    .unwrap_or_else(|| RateLimitKey::new(UNRESOLVED_KEY));
                self.sink.append(&key, request);
                Decision::unavailable(false)
            }
        }
    }

    /// Replace the refill rate. Takes effect for the next evaluation.
    pub fn update_fill_rate(&self, fill_rate: f64) -> Result<()> {
        validate_fill_rate(fill_rate)?;
        let previous = f64::from_bits(self.fill_rate.swap(fill_rate.to_bits(), Ordering::AcqRel));
        info!(previous, fill_rate, "Fill rate updated");
        Ok(())
    }

    /// Replace the capacity. Stored tokens above it are clamped when their
    /// key is next evaluated.
    pub fn update_capacity(&self, capacity: u64) -> Result<()> {
        validate_capacity(capacity)?;
        let previous = self.capacity.swap(capacity, Ordering::AcqRel);
        info!(previous, capacity, "Capacity updated");
        Ok(())
    }

    pub fn fill_rate(&self) -> f64 {
        f64::from_bits(self.fill_rate.load(Ordering::Acquire))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Snapshot of the bucket for `key`, if the key has been seen.
    pub fn bucket(&self, key: &RateLimitKey) -> Option<Bucket> {
        self.store.get(key)
    }

    /// Number of keys with a bucket.
    pub fn bucket_count(&self) -> usize {
        self.store.len()
    }

    pub fn rejection_sink(&self) -> &Arc<RejectionSink> {
        &self.sink
    }
}

impl<S: BucketStore, C: Clock> RateLimiterBackend for TokenBucketLimiter<S, C> {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn is_allowed(&self, request: &Request) -> Decision {
        TokenBucketLimiter::is_allowed(self, request)
    }

    fn update_fill_rate(&self, fill_rate: f64) -> Result<()> {
        TokenBucketLimiter::update_fill_rate(self, fill_rate)
    }

    fn update_capacity(&self, capacity: u64) -> Result<()> {
        TokenBucketLimiter::update_capacity(self, capacity)
    }

    fn rejection_sink(&self) -> &Arc<RejectionSink> {
        TokenBucketLimiter::rejection_sink(self)
    }
}

impl<S: fmt::Debug, C: fmt::Debug> fmt::Debug for TokenBucketLimiter<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .field("fill_rate", &f64::from_bits(self.fill_rate.load(Ordering::Relaxed)))
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "panic with non-string payload"
    }
}
