//! Shared store seam.
//!
//! Every cross-process state change in this crate goes through exactly one [`SharedStore`]
//! call, and every call is a single atomic step on the backend (a Lua script on Redis, one
//! mutex section in [`InMemoryStore`]). There is never a read in one call followed by a write in
//! another, so no compare-and-swap race exists between observing and acting on quota, bucket or
//! pool state.
//!
//! Time used for TTLs and bucket refill is the store's own clock, so replicas with skewed
//! clocks still agree.

use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::{ResourceId, ResourceMeta};
use crate::error::StoreError;

pub mod memory;
pub use memory::InMemoryStore;

/// Key of a per-resource entry under `prefix`.
pub fn member_key(prefix: &str, id: ResourceId) -> String {
    format!("{prefix}:{id}")
}

/// Result of a fixed-window check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Post-increment count when allowed, unchanged count otherwise.
    pub current: u64,
    /// Time until the window resets; zero when allowed.
    pub retry_after: Duration,
}

/// One rule of a multi-window check. Keys within one check must be distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub key: String,
    pub limit: u64,
    pub window: Duration,
}

/// Result of checking several windows as a conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSetOutcome {
    /// Every window had headroom; `counts` are the post-increment values in rule order.
    Allowed { counts: Vec<u64> },
    /// The first window without headroom. Nothing was consumed.
    Rejected { index: usize, current: u64, retry_after: Duration },
}

/// Inspection of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDetail {
    pub current: u64,
    /// Remaining lifetime; `None` when the key never expires.
    pub ttl: Option<Duration>,
}

/// Result of a token bucket draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Whole tokens left after the draw.
    pub remaining: u64,
    /// Time until the requested tokens will be available; zero when allowed.
    pub wait: Duration,
}

/// Arguments of the atomic admission step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitRequest {
    /// Pool entry holding eligible members and their weights.
    pub pool_key: String,
    /// Metadata of resource `id` lives at `{meta_prefix}:{id}`.
    pub meta_prefix: String,
    /// Daily counter of resource `id` lives at `{daily_prefix}:{id}`.
    pub daily_prefix: String,
    /// Per-second counter of resource `id` lives at `{rate_prefix}:{id}`.
    pub rate_prefix: String,
    /// Caller-specified resource; bypasses the pool.
    pub requested: Option<ResourceId>,
    /// Balancer pick; honoured when it is still a pool member.
    pub preferred: Option<ResourceId>,
    pub units: u64,
    /// Lifetime given to a daily counter created by this call.
    pub daily_ttl: Duration,
}

/// Reply of the atomic admission step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitReply {
    /// Units were reserved against both the daily quota and the per-second rate.
    Admitted(ResourceMeta),
    /// The pool entry does not exist.
    PoolMissing,
    /// The candidate has no cached metadata.
    ResourceMissing(ResourceId),
    /// The candidate's daily quota is used up.
    QuotaExceeded(ResourceId),
    /// The candidate has `remaining` daily units left, fewer than requested.
    InsufficientQuota { id: ResourceId, remaining: u64 },
    /// The candidate's per-second window is full for `wait`.
    RateLimited { id: ResourceId, wait: Duration },
}

/// Per-second windows used by admission.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Atomic operations the admission primitives are built from.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Set `key` to `value` with `ttl` only if it does not exist.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Increment by `units` if the result stays within `limit`. The window TTL is set only
    /// when the counter is created.
    async fn window_allow(
        &self,
        key: &str,
        limit: u64,
        units: u64,
        window: Duration,
    ) -> Result<WindowOutcome, StoreError>;

    /// Increment every window by `units` if all stay within their limits; otherwise change
    /// nothing and report the first window that would overflow.
    async fn windows_allow(
        &self,
        rules: &[WindowSpec],
        units: u64,
    ) -> Result<RuleSetOutcome, StoreError>;

    /// Give back `units`, never going below zero. A missing counter stays missing.
    async fn counter_decr(&self, key: &str, units: u64) -> Result<u64, StoreError>;

    async fn counter_detail(&self, key: &str) -> Result<Option<CounterDetail>, StoreError>;

    /// Refill `capacity` tokens per `interval` proportionally to elapsed time, then take
    /// `requested` if enough are present.
    async fn bucket_take(
        &self,
        key: &str,
        capacity: u64,
        interval: Duration,
        requested: u64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Replace pool membership. An empty member list deletes the pool.
    async fn pool_replace(
        &self,
        key: &str,
        members: &[(ResourceId, i64)],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Members and weights, ascending by id.
    async fn pool_members(&self, key: &str) -> Result<Vec<(ResourceId, i64)>, StoreError>;

    /// Remove one member. Removing the last member deletes the pool.
    async fn pool_remove(&self, key: &str, id: ResourceId) -> Result<(), StoreError>;

    /// Select a candidate, check its cached quota and rate, and reserve units against both.
    async fn admit(&self, request: &AdmitRequest) -> Result<AdmitReply, StoreError>;
}
