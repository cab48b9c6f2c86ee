use std::sync::Arc;
use std::time::Duration;

use super::counter_key;
use crate::error::{QuotaExceeded, Result, StoreError, TollgateError};
use crate::jitter::as_millis_saturated;
use crate::store::{CounterDetail, RuleSetOutcome, SharedStore, WindowSpec};

/// One limit of a multi-window quota, e.g. 3 per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingRule {
    pub quota: u64,
    pub window: Duration,
}

impl SlidingRule {
    pub fn new(quota: u64, window: Duration) -> Self {
        Self { quota, window }
    }
}

/// The first rule a rejected request would have broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleRejection {
    /// Position of the rule in the slice passed to [`SlidingQuota::allow`].
    pub index: usize,
    pub quota: u64,
    pub window: Duration,
    pub current: u64,
    pub retry_after: Duration,
}

/// Verdict of a multi-window check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlidingDecision {
    /// Every window took the units; `counts` follow rule order.
    Allowed { counts: Vec<u64> },
    Rejected(RuleRejection),
}

impl SlidingDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SlidingDecision::Allowed { .. })
    }

    pub fn into_result(self) -> Result<Vec<u64>> {
        match self {
            SlidingDecision::Allowed { counts } => Ok(counts),
            SlidingDecision::Rejected(r) => Err(TollgateError::QuotaExceeded(QuotaExceeded {
                limit: r.quota,
                current: r.current,
                retry_after: r.retry_after,
            })),
        }
    }
}

/// Conjunction of fixed windows: a request passes only if every window has room, and a rejected
/// request consumes nothing from any window.
#[derive(Debug)]
pub struct SlidingQuota<S: SharedStore + ?Sized> {
    store: Arc<S>,
    prefix: String,
}

impl<S: SharedStore + ?Sized> Clone for SlidingQuota<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), prefix: self.prefix.clone() }
    }
}

impl<S: SharedStore + ?Sized> SlidingQuota<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }

    pub fn key(&self, dimension: &str, target: &str, window: Duration) -> String {
        counter_key(&self.prefix, dimension, target, &as_millis_saturated(window).to_string())
    }

    pub async fn allow(
        &self,
        dimension: &str,
        target: &str,
        rules: &[SlidingRule],
        units: u64,
    ) -> Result<SlidingDecision> {
        if rules.is_empty() {
            return Ok(SlidingDecision::Allowed { counts: Vec::new() });
        }
        validate(rules)?;

        let specs: Vec<WindowSpec> = rules
            .iter()
            .map(|r| WindowSpec {
                key: self.key(dimension, target, r.window),
                limit: r.quota,
                window: r.window,
            })
            .collect();

        match self.store.windows_allow(&specs, units).await? {
            RuleSetOutcome::Allowed { counts } => Ok(SlidingDecision::Allowed { counts }),
            RuleSetOutcome::Rejected { index, current, retry_after } => {
                let rule = *rules.get(index).ok_or_else(|| {
                    StoreError::Codec(format!("rejected rule {index} of {}", rules.len()))
                })?;
                tracing::debug!(
                    dimension,
                    target,
                    rule = index,
                    quota = rule.quota,
                    current,
                    "sliding quota rejected"
                );
                Ok(SlidingDecision::Rejected(RuleRejection {
                    index,
                    quota: rule.quota,
                    window: rule.window,
                    current,
                    retry_after,
                }))
            }
        }
    }

    pub async fn decr(&self, dimension: &str, target: &str, rules: &[SlidingRule]) -> Result<()> {
        self.decr_n(dimension, target, rules, 1).await
    }

    /// Give back `units` to every window of `rules`.
    pub async fn decr_n(
        &self,
        dimension: &str,
        target: &str,
        rules: &[SlidingRule],
        units: u64,
    ) -> Result<()> {
        validate(rules)?;
        for rule in rules {
            self.store.counter_decr(&self.key(dimension, target, rule.window), units).await?;
        }
        Ok(())
    }

    /// Per-rule state in rule order; `None` where the window is not open.
    pub async fn detail(
        &self,
        dimension: &str,
        target: &str,
        rules: &[SlidingRule],
    ) -> Result<Vec<Option<CounterDetail>>> {
        let mut details = Vec::with_capacity(rules.len());
        for rule in rules {
            let key = self.key(dimension, target, rule.window);
            details.push(self.store.counter_detail(&key).await?);
        }
        Ok(details)
    }

    pub async fn reset(&self, dimension: &str, target: &str, rules: &[SlidingRule]) -> Result<()> {
        for rule in rules {
            self.store.delete(&self.key(dimension, target, rule.window)).await?;
        }
        Ok(())
    }
}

/// Windows must be positive and distinct: rules sharing a window would share one counter.
fn validate(rules: &[SlidingRule]) -> Result<()> {
    for (i, rule) in rules.iter().enumerate() {
        if rule.window.is_zero() {
            return Err(TollgateError::InvalidArgument("quota window must be positive".into()));
        }
        if rules[..i].iter().any(|earlier| earlier.window == rule.window) {
            return Err(TollgateError::InvalidArgument(format!(
                "rule {i} repeats the {:?} window",
                rule.window
            )));
        }
    }
    Ok(())
}
