use std::sync::Arc;
use std::time::Duration;

use super::{counter_key, QuotaDecision};
use crate::error::{Result, TollgateError};
use crate::jitter::as_millis_saturated;
use crate::store::{CounterDetail, SharedStore};

/// Counter whose window opens with the first increment and lasts `window`.
#[derive(Debug)]
pub struct FixedWindowQuota<S: SharedStore + ?Sized> {
    store: Arc<S>,
    prefix: String,
}

impl<S: SharedStore + ?Sized> Clone for FixedWindowQuota<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), prefix: self.prefix.clone() }
    }
}

impl<S: SharedStore + ?Sized> FixedWindowQuota<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }

    pub fn key(&self, dimension: &str, target: &str, window: Duration) -> String {
        counter_key(&self.prefix, dimension, target, &as_millis_saturated(window).to_string())
    }

    /// Consume `units` if the window still has room for them.
    pub async fn allow(
        &self,
        dimension: &str,
        target: &str,
        limit: u64,
        window: Duration,
        units: u64,
    ) -> Result<QuotaDecision> {
        if window.is_zero() {
            return Err(TollgateError::InvalidArgument("quota window must be positive".into()));
        }
        let key = self.key(dimension, target, window);
        let outcome = self.store.window_allow(&key, limit, units, window).await?;
        if !outcome.allowed {
            tracing::debug!(key = %key, limit, current = outcome.current, "fixed window rejected");
        }
        Ok(QuotaDecision::from_outcome(limit, outcome))
    }

    pub async fn decr(&self, dimension: &str, target: &str, window: Duration) -> Result<u64> {
        self.decr_n(dimension, target, window, 1).await
    }

    /// Give back `units`; the count never drops below zero.
    pub async fn decr_n(
        &self,
        dimension: &str,
        target: &str,
        window: Duration,
        units: u64,
    ) -> Result<u64> {
        let key = self.key(dimension, target, window);
        Ok(self.store.counter_decr(&key, units).await?)
    }

    /// Current count and remaining lifetime, if the window is open.
    pub async fn detail(
        &self,
        dimension: &str,
        target: &str,
        window: Duration,
    ) -> Result<Option<CounterDetail>> {
        Ok(self.store.counter_detail(&self.key(dimension, target, window)).await?)
    }

    pub async fn reset(&self, dimension: &str, target: &str, window: Duration) -> Result<()> {
        Ok(self.store.delete(&self.key(dimension, target, window)).await?)
    }
}
