//! Per-key token bucket state and refill arithmetic.

use std::time::Instant;

/// A request is admitted only while the bucket holds strictly more than this.
pub const ADMISSION_THRESHOLD: f64 = 1.0;

/// Tokens consumed by one admitted request.
const TOKEN_COST: f64 = 1.0;

/// Token bucket state for a single key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Tokens available as of `last_refill_at`
    pub tokens: f64,
    /// When tokens were last committed by an admitted request
    pub last_refill_at: Instant,
}

/// Outcome of evaluating one request against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Tokens available before the decision, after refill and clamping
    pub candidate_tokens: f64,
}

impl Bucket {
    /// A bucket for a key seen for the first time. New keys start empty.
    pub fn empty(now: Instant) -> Self {
        Self {
            tokens: 0.0,
            last_refill_at: now,
        }
    }

    /// Tokens available at `now`, clamped to `capacity`.
    ///
    /// A `now` earlier than `last_refill_at` counts as no elapsed time.
    pub fn candidate_tokens(&self, now: Instant, fill_rate: f64, capacity: u64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        let refill = fill_rate * elapsed.as_secs_f64();
        (self.tokens + refill).min(capacity as f64)
    }

    /// Refill, decide, and commit on admission.
    ///
    /// A denied request leaves the bucket untouched, so the next refill is
    /// measured from the last admitted request. The timestamp never moves
    /// backwards: an admission at an earlier `now` keeps the later stamp, so
    /// time already refilled is not counted again.
    pub fn try_acquire(&mut self, now: Instant, fill_rate: f64, capacity: u64) -> Admission {
        let candidate_tokens = self.candidate_tokens(now, fill_rate, capacity);
        let allowed = candidate_tokens > ADMISSION_THRESHOLD;

        if allowed {
            self.tokens = candidate_tokens - TOKEN_COST;
            self.last_refill_at = self.last_refill_at.max(now);
        }

        Admission {
            allowed,
            candidate_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_new_bucket_starts_empty() {
        let now = Instant::now();
        let bucket = Bucket::empty(now);
        assert_eq!(bucket.tokens, 0.0);
        assert_eq!(bucket.last_refill_at, now);
    }

    #[test]
    fn test_fresh_bucket_denies() {
        let now = Instant::now();
        let mut bucket = Bucket::empty(now);
        let admission = bucket.try_acquire(now, 5.0, 10);
        assert!(!admission.allowed);
        assert_eq!(admission.candidate_tokens, 0.0);
    }

    #[test]
    fn test_exactly_one_token_denies() {
        let start = Instant::now();
        let mut bucket = Bucket::empty(start);
        // 5 tokens/s * 0.2s = 1.0 token, which is not strictly above one
        let admission = bucket.try_acquire(start + Duration::from_millis(200), 5.0, 10);
        assert!(!admission.allowed);
        assert!((admission.candidate_tokens - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_admission_consumes_one_token() {
        let start = Instant::now();
        let mut bucket = Bucket::empty(start);
        let later = start + Duration::from_millis(400);

        let admission = bucket.try_acquire(later, 5.0, 10);
        assert!(admission.allowed);
        assert!((bucket.tokens - 1.0).abs() < EPSILON);
        assert_eq!(bucket.last_refill_at, later);
    }

    #[test]
    fn test_denial_leaves_bucket_untouched() {
        let start = Instant::now();
        let mut bucket = Bucket::empty(start);
        let before = bucket;

        bucket.try_acquire(start + Duration::from_millis(100), 5.0, 10);
        assert_eq!(bucket, before);
    }

    #[test]
    fn test_refill_clamped_to_capacity() {
        let start = Instant::now();
        let bucket = Bucket::empty(start);
        let candidate = bucket.candidate_tokens(start + Duration::from_secs(3600), 5.0, 10);
        assert_eq!(candidate, 10.0);
    }

    #[test]
    fn test_stored_tokens_above_capacity_are_clamped() {
        let now = Instant::now();
        let bucket = Bucket {
            tokens: 8.0,
            last_refill_at: now,
        };
        assert_eq!(bucket.candidate_tokens(now, 5.0, 5), 5.0);
    }

    #[test]
    fn test_clock_skew_counts_as_no_elapsed_time() {
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        let bucket = Bucket {
            tokens: 3.0,
            last_refill_at: later,
        };
        assert_eq!(bucket.candidate_tokens(start, 5.0, 10), 3.0);
    }

    #[test]
    fn test_admission_under_skew_keeps_later_timestamp() {
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        let mut bucket = Bucket {
            tokens: 3.0,
            last_refill_at: later,
        };

        assert!(bucket.try_acquire(start, 5.0, 10).allowed);
        assert_eq!(bucket.tokens, 2.0);
        assert_eq!(bucket.last_refill_at, later);
    }
}
