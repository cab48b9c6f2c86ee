//! Quota counters.
//!
//! All flavors share one contract: a call increments the counter by `units` only when the result
//! stays within the limit, and otherwise leaves it untouched and reports how long until the
//! window resets. The check and the increment are a single store operation.
//!
//! - [`FixedWindowQuota`]: a window that starts with the first increment.
//! - [`SlidingQuota`]: several windows evaluated as a conjunction.
//! - [`CalendarQuota`]: windows aligned to hour, day, month or year boundaries.
//!
//! Keys are `prefix:dimension:target` followed by the window length in milliseconds, or by the
//! period id for calendar counters.

use std::time::Duration;

use crate::error::{QuotaExceeded, Result, TollgateError};
use crate::store::WindowOutcome;

pub mod calendar;
pub mod fixed;
pub mod sliding;

pub use calendar::CalendarQuota;
pub use fixed::FixedWindowQuota;
pub use sliding::{RuleRejection, SlidingDecision, SlidingQuota, SlidingRule};

/// Verdict of a single-window quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u64,
    /// Post-increment count when allowed, unchanged count otherwise.
    pub current: u64,
    /// Zero when allowed.
    pub retry_after: Duration,
}

impl QuotaDecision {
    pub(crate) fn from_outcome(limit: u64, outcome: WindowOutcome) -> Self {
        Self {
            allowed: outcome.allowed,
            limit,
            current: outcome.current,
            retry_after: outcome.retry_after,
        }
    }

    /// Units left before the next rejection.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }

    /// Turn a rejection into [`TollgateError::QuotaExceeded`].
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(TollgateError::QuotaExceeded(QuotaExceeded {
                limit: self.limit,
                current: self.current,
                retry_after: self.retry_after,
            }))
        }
    }
}

/// `prefix:dimension:target:suffix`
pub(crate) fn counter_key(prefix: &str, dimension: &str, target: &str, suffix: &str) -> String {
    format!("{prefix}:{dimension}:{target}:{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_decision_converts_to_error() {
        let decision = QuotaDecision {
            allowed: false,
            limit: 3,
            current: 3,
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(decision.remaining(), 0);
        let err = decision.into_result().unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn keys_join_with_colons() {
        assert_eq!(counter_key("q", "user", "42", "60000"), "q:user:42:60000");
    }
}
