//! Distributed token bucket rate limiting.
//!
//! - [`TokenBucket`]: refill-and-take against a [`SharedStore`](crate::store::SharedStore), with
//!   a cancellable [`TokenBucket::wait`] for callers that prefer to block.
//! - [`RateLimitLayer`]: tower middleware that asks a bucket for one token per request.
//!
//! # Architecture
//!
//! The refill arithmetic runs inside the store call, using the store's clock, so every replica
//! sharing a key sees one bucket. The middleware doesn't know how the bucket is stored, only which
//! key and shape to ask for.

use std::time::Duration;

pub mod bucket;
pub mod middleware;

pub use bucket::{BucketShape, TokenBucket};
pub use middleware::{GuardError, RateLimitLayer, RateLimitService};

/// The decision returned by a bucket draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    pub allowed: bool,
    /// Whole tokens left after this draw.
    /// Useful for `X-RateLimit-Remaining` headers.
    pub remaining: u64,
    /// How long until the requested tokens are available; zero when allowed.
    /// Useful for `Retry-After` headers.
    pub wait: Duration,
}
