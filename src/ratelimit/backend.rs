//! Rate limiter trait for abstracting over admission algorithms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use super::key::{Request, StrategyExtractor};
use super::limiter::TokenBucketLimiter;
use super::sink::RejectionSink;
use super::store::{LockedBucketStore, StoreKind};
use crate::config::LimiterSettings;
use crate::error::{Result, TollgateError};

/// Admission algorithms a limiter can be configured with.
///
/// Only [`Algorithm::TokenBucket`] has an implementation. The others name
/// future extension points and are rejected by [`build_limiter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindowCounter,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindowCounter => "sliding_window_counter",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was admitted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// The bucket had tokens to spare
    Allowed,
    /// The bucket was exhausted
    RateLimited,
    /// The limiter failed and the failure policy decided
    LimiterUnavailable,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Allowed => "allowed",
            DecisionReason::RateLimited => "rate limit exceeded",
            DecisionReason::LimiterUnavailable => "rate limiter unavailable",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for a single request. A denial is an ordinary outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
}

impl Decision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Allowed,
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            allowed: false,
            reason: DecisionReason::RateLimited,
        }
    }

    pub fn unavailable(allowed: bool) -> Self {
        Self {
            allowed,
            reason: DecisionReason::LimiterUnavailable,
        }
    }
}

/// Trait for rate limiter implementations.
///
/// Call sites hold a `dyn RateLimiterBackend` so that adding an algorithm
/// does not change them.
pub trait RateLimiterBackend: Send + Sync {
    /// The algorithm this limiter implements.
    fn algorithm(&self) -> Algorithm;

    /// Decide whether `request` may proceed. Never panics.
    fn is_allowed(&self, request: &Request) -> Decision;

    /// Replace the refill rate for all subsequent evaluations.
    fn update_fill_rate(&self, fill_rate: f64) -> Result<()>;

    /// Replace the bucket capacity for all subsequent evaluations.
    fn update_capacity(&self, capacity: u64) -> Result<()>;

    /// Where rejected requests are collected.
    fn rejection_sink(&self) -> &Arc<RejectionSink>;
}

/// Build the limiter described by `settings`, collecting rejections in `sink`.
pub fn build_limiter(
    settings: &LimiterSettings,
    sink: Arc<RejectionSink>,
) -> Result<Box<dyn RateLimiterBackend>> {
    if settings.algorithm != Algorithm::TokenBucket {
        return Err(TollgateError::UnsupportedAlgorithm(
            settings.algorithm.to_string(),
        ));
    }

    let mut extractor = StrategyExtractor::new(settings.key_strategy);
    if let Some(ref anonymous) = settings.anonymous_key {
        extractor = extractor.with_anonymous_key(anonymous.clone());
    }

    let limiter = TokenBucketLimiter::new(settings.fill_rate, settings.capacity)?
        .with_key_extractor(extractor)
        .with_rejection_sink(sink)
        .with_failure_policy(settings.failure_policy);

    info!(
        algorithm = %settings.algorithm,
        fill_rate = settings.fill_rate,
        capacity = settings.capacity,
        key_strategy = ?settings.key_strategy,
        store = ?settings.store,
        failure_policy = ?settings.failure_policy,
        "Rate limiter initialized"
    );

    let limiter: Box<dyn RateLimiterBackend> = match settings.store {
        StoreKind::Sharded => Box::new(limiter),
        StoreKind::GlobalLock => Box::new(limiter.with_store(LockedBucketStore::new())),
    };
    Ok(limiter)
}
