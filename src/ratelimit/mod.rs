//! Rate limiting logic and state management.

mod bucket;
mod limiter;
mod router;
mod slowstart;

pub use bucket::{BucketParams, TokenBucket};
pub use limiter::RateLimiter;
pub use slowstart::{SlowStart, StepMode};
