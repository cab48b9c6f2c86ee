use std::sync::Arc;
use std::time::Duration;

use super::{counter_key, QuotaDecision};
use crate::calendar::{local_time, Period};
use crate::clock::{Clock, SystemClock};
use crate::config::CalendarConfig;
use crate::error::Result;
use crate::jitter::Jitter;
use crate::store::{CounterDetail, SharedStore};

/// Counter aligned to calendar boundaries in a fixed UTC offset.
///
/// The key carries the period id, so a new period always starts from zero. Keys of the same
/// period are given a TTL of the time left to the boundary plus a random extension of at most
/// the configured jitter, so they do not all expire in the same instant.
#[derive(Debug)]
pub struct CalendarQuota<S: SharedStore + ?Sized> {
    store: Arc<S>,
    prefix: String,
    config: CalendarConfig,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
}

impl<S: SharedStore + ?Sized> Clone for CalendarQuota<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            config: self.config,
            clock: Arc::clone(&self.clock),
            jitter: self.jitter,
        }
    }
}

impl<S: SharedStore + ?Sized> CalendarQuota<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>, config: CalendarConfig) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            config,
            clock: Arc::new(SystemClock),
            jitter: Jitter::Full,
        }
    }

    /// Clock used to decide which period "now" falls in.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Key of the period containing now.
    pub fn key(&self, dimension: &str, target: &str, period: Period) -> String {
        let now = local_time(self.clock.now_millis(), self.config.offset());
        counter_key(&self.prefix, dimension, target, &period.id(now))
    }

    pub async fn allow(
        &self,
        dimension: &str,
        target: &str,
        period: Period,
        limit: u64,
        units: u64,
    ) -> Result<QuotaDecision> {
        let now = local_time(self.clock.now_millis(), self.config.offset());
        let key = counter_key(&self.prefix, dimension, target, &period.id(now));
        let remaining = period.remaining(now);
        let ttl =
            self.jitter.extend(remaining, self.config.max_jitter()).max(Duration::from_millis(1));

        let mut outcome = self.store.window_allow(&key, limit, units, ttl).await?;
        if !outcome.allowed {
            // The next period's key opens at the boundary, before this key's jittered expiry.
            outcome.retry_after = remaining.max(Duration::from_millis(1));
            tracing::debug!(
                key = %key,
                period = %period,
                limit,
                current = outcome.current,
                "calendar quota rejected"
            );
        }
        Ok(QuotaDecision::from_outcome(limit, outcome))
    }

    pub async fn decr(&self, dimension: &str, target: &str, period: Period) -> Result<u64> {
        self.decr_n(dimension, target, period, 1).await
    }

    pub async fn decr_n(
        &self,
        dimension: &str,
        target: &str,
        period: Period,
        units: u64,
    ) -> Result<u64> {
        Ok(self.store.counter_decr(&self.key(dimension, target, period), units).await?)
    }

    pub async fn detail(
        &self,
        dimension: &str,
        target: &str,
        period: Period,
    ) -> Result<Option<CounterDetail>> {
        Ok(self.store.counter_detail(&self.key(dimension, target, period)).await?)
    }

    pub async fn reset(&self, dimension: &str, target: &str, period: Period) -> Result<()> {
        Ok(self.store.delete(&self.key(dimension, target, period)).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;

    const UTC8: i32 = 8 * 3600;

    fn millis(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> u64 {
        let offset = FixedOffset::east_opt(UTC8).unwrap();
        offset.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis() as u64
    }

    fn quota(jitter: Jitter, max_jitter: Duration) -> (CalendarQuota<InMemoryStore>, ManualClock) {
        let clock = ManualClock::new(millis(2026, 10, 14, 23, 0));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let cfg = CalendarConfig::new(UTC8, max_jitter).unwrap();
        let quota = CalendarQuota::new(store, "cal", cfg)
            .with_clock(Arc::new(clock.clone()))
            .with_jitter(jitter);
        (quota, clock)
    }

    #[tokio::test]
    async fn daily_counter_uses_local_date_and_expires_at_midnight() {
        let (quota, _) = quota(Jitter::None, Duration::ZERO);
        assert_eq!(quota.key("sms", "555", Period::Day), "cal:sms:555:20261014");

        assert!(quota.allow("sms", "555", Period::Day, 2, 1).await.unwrap().allowed);
        let detail = quota.detail("sms", "555", Period::Day).await.unwrap().unwrap();
        assert_eq!(detail.ttl, Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn new_day_starts_from_zero() {
        let (quota, clock) = quota(Jitter::None, Duration::ZERO);
        quota.allow("sms", "1", Period::Day, 1, 1).await.unwrap();
        let rejected = quota.allow("sms", "1", Period::Day, 1, 1).await.unwrap();
        assert!(!rejected.allowed);
        assert!(rejected.retry_after <= Duration::from_secs(3600));

        clock.advance(Duration::from_secs(3600));
        assert_eq!(quota.key("sms", "1", Period::Day), "cal:sms:1:20261015");
        assert!(quota.allow("sms", "1", Period::Day, 1, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn jitter_extends_ttl_within_bound() {
        let (quota, _) = quota(Jitter::Full, Duration::from_secs(60));
        quota.allow("email", "a", Period::Hour, 5, 1).await.unwrap();
        let ttl = quota.detail("email", "a", Period::Hour).await.unwrap().unwrap().ttl.unwrap();
        assert!(ttl >= Duration::from_secs(3600));
        assert!(ttl <= Duration::from_secs(3660));
    }

    #[tokio::test]
    async fn rejection_waits_for_boundary_not_jittered_expiry() {
        let (quota, _) = quota(Jitter::Equal, Duration::from_secs(600));
        quota.allow("sms", "4", Period::Day, 1, 1).await.unwrap();
        let ttl = quota.detail("sms", "4", Period::Day).await.unwrap().unwrap().ttl.unwrap();
        assert!(ttl >= Duration::from_secs(3900), "{ttl:?}");

        let rejected = quota.allow("sms", "4", Period::Day, 1, 1).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn decr_and_reset() {
        let (quota, _) = quota(Jitter::None, Duration::ZERO);
        quota.allow("sms", "2", Period::Month, 10, 5).await.unwrap();
        assert_eq!(quota.decr_n("sms", "2", Period::Month, 2).await.unwrap(), 3);
        assert_eq!(quota.decr("sms", "2", Period::Month).await.unwrap(), 2);
        quota.reset("sms", "2", Period::Month).await.unwrap();
        assert!(quota.detail("sms", "2", Period::Month).await.unwrap().is_none());
    }
}
