use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::BucketDecision;
use crate::error::{Result, TollgateError};
use crate::sleeper::{sleep_or_cancel, Sleeper, TokioSleeper};
use crate::store::SharedStore;

/// Capacity and refill interval of one bucket: `capacity` tokens are restored per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketShape {
    pub capacity: u64,
    pub interval: Duration,
}

impl BucketShape {
    pub fn new(capacity: u64, interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(TollgateError::InvalidArgument("bucket capacity must be > 0".into()));
        }
        if interval.is_zero() {
            return Err(TollgateError::InvalidArgument("bucket interval must be positive".into()));
        }
        Ok(Self { capacity, interval })
    }

    /// `permits` tokens per second.
    pub fn per_second(permits: u64) -> Result<Self> {
        Self::new(permits, Duration::from_secs(1))
    }
}

/// A token bucket rate limiter shared through the store.
///
/// Buckets are addressed by key under a common prefix. A bucket that has never been drawn from is
/// full.
#[derive(Debug)]
pub struct TokenBucket<S: SharedStore + ?Sized> {
    store: Arc<S>,
    prefix: String,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: SharedStore + ?Sized> Clone for TokenBucket<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<S: SharedStore + ?Sized> TokenBucket<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into(), sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Take `requested` tokens if they are available now.
    pub async fn allow(
        &self,
        key: &str,
        capacity: u64,
        interval: Duration,
        requested: u64,
    ) -> Result<BucketDecision> {
        let shape = BucketShape::new(capacity, interval)?;
        self.take(key, shape, requested).await
    }

    /// [`allow`](Self::allow) with a prevalidated shape.
    pub async fn take(
        &self,
        key: &str,
        shape: BucketShape,
        requested: u64,
    ) -> Result<BucketDecision> {
        if requested > shape.capacity {
            return Err(TollgateError::InvalidArgument(format!(
                "requested {requested} tokens from a bucket of capacity {}",
                shape.capacity
            )));
        }
        let key = self.bucket_key(key);
        let outcome =
            self.store.bucket_take(&key, shape.capacity, shape.interval, requested).await?;
        Ok(BucketDecision {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            wait: outcome.wait,
        })
    }

    /// Block until `requested` tokens have been taken, or `cancel` fires.
    pub async fn wait(
        &self,
        key: &str,
        capacity: u64,
        interval: Duration,
        requested: u64,
        cancel: &CancellationToken,
    ) -> Result<BucketDecision> {
        let shape = BucketShape::new(capacity, interval)?;
        loop {
            let decision = self.take(key, shape, requested).await?;
            if decision.allowed {
                return Ok(decision);
            }
            tracing::debug!(key = %key, wait = ?decision.wait, "waiting for tokens");
            sleep_or_cancel(self.sleeper.as_ref(), decision.wait, cancel).await?;
        }
    }
}
