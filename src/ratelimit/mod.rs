//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod key;
mod limiter;
mod sink;
mod store;

pub use backend::{build_limiter, Algorithm, Decision, DecisionReason, RateLimiterBackend};
pub use bucket::{Admission, Bucket, ADMISSION_THRESHOLD};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{KeyExtractor, KeyStrategy, RateLimitKey, Request, StrategyExtractor};
pub use limiter::{FailurePolicy, TokenBucketLimiter};
pub use sink::{RejectionRecord, RejectionSink};
pub use store::{BucketStore, LockedBucketStore, ShardedBucketStore, StoreKind};
