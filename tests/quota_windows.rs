mod common;

use std::sync::Arc;
use std::time::Duration;

use common::test_helpers::NOON_UTC;
use futures::future::join_all;
use tollgate::prelude::*;
use tollgate::{Jitter, ManualClock};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

fn setup() -> (Arc<InMemoryStore>, ManualClock) {
    let clock = ManualClock::new(NOON_UTC);
    (Arc::new(InMemoryStore::with_clock(clock.clone())), clock)
}

#[tokio::test]
async fn concurrent_callers_never_overshoot_fixed_limit() {
    let (store, _) = setup();
    let quota = FixedWindowQuota::new(store, "q");

    let results = join_all((0..50).map(|_| quota.allow("login", "alice", 20, MINUTE, 1))).await;
    let allowed = results.iter().filter(|r| r.as_ref().is_ok_and(|d| d.allowed)).count();
    assert_eq!(allowed, 20);

    let detail = quota.detail("login", "alice", MINUTE).await.unwrap().unwrap();
    assert_eq!(detail.current, 20);
}

#[tokio::test]
async fn rejection_converts_into_quota_exceeded() {
    let (store, clock) = setup();
    let quota = FixedWindowQuota::new(store, "q");

    quota.allow("otp", "+15550100", 1, MINUTE, 1).await.unwrap();
    clock.advance(Duration::from_secs(15));
    let err = quota.allow("otp", "+15550100", 1, MINUTE, 1).await.unwrap().into_result();
    match err {
        Err(TollgateError::QuotaExceeded(detail)) => {
            assert_eq!(detail.limit, 1);
            assert_eq!(detail.current, 1);
            assert_eq!(detail.retry_after, Duration::from_secs(45));
        }
        other => panic!("expected quota exceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn rule_set_is_all_or_nothing() {
    let (store, clock) = setup();
    let quota = SlidingQuota::new(store, "s");
    let rules = [SlidingRule::new(2, MINUTE), SlidingRule::new(3, HOUR)];

    for _ in 0..2 {
        assert!(quota.allow("sms", "555", &rules, 1).await.unwrap().is_allowed());
    }
    let minute_full = quota.allow("sms", "555", &rules, 1).await.unwrap();
    assert!(matches!(minute_full, SlidingDecision::Rejected(ref r) if r.index == 0));

    clock.advance(MINUTE);
    assert!(quota.allow("sms", "555", &rules, 1).await.unwrap().is_allowed());
    let hour_full = quota.allow("sms", "555", &rules, 1).await.unwrap();
    let SlidingDecision::Rejected(rejection) = hour_full else {
        panic!("expected the hourly rule to reject");
    };
    assert_eq!(rejection.index, 1);
    assert_eq!(rejection.current, 3);
    assert_eq!(rejection.retry_after, HOUR - MINUTE);

    // The rejected call left the minute window untouched.
    let counts = quota.detail("sms", "555", &rules).await.unwrap();
    assert_eq!(counts[0].map(|c| c.current), Some(1));
    assert_eq!(counts[1].map(|c| c.current), Some(3));
}

#[tokio::test]
async fn calendar_quota_rolls_over_at_local_midnight() {
    let (store, clock) = setup();
    // UTC-5: noon UTC is 07:00 local, midnight is 17 hours away.
    let config = CalendarConfig::new(-5 * 3600, Duration::ZERO).unwrap();
    let quota = CalendarQuota::new(store, "cal", config)
        .with_clock(Arc::new(clock.clone()))
        .with_jitter(Jitter::None);

    let first = quota.allow("api", "acct-9", Period::Day, 1, 1).await.unwrap();
    assert!(first.allowed);
    let denied = quota.allow("api", "acct-9", Period::Day, 1, 1).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(17 * 3600));

    clock.advance(Duration::from_secs(17 * 3600));
    assert_eq!(quota.key("api", "acct-9", Period::Day), "cal:api:acct-9:20261015");
    assert!(quota.allow("api", "acct-9", Period::Day, 1, 1).await.unwrap().allowed);
}

#[tokio::test]
async fn decrement_returns_units_to_every_flavor() {
    let (store, clock) = setup();
    let fixed = FixedWindowQuota::new(Arc::clone(&store), "q");
    let sliding = SlidingQuota::new(Arc::clone(&store), "s");
    let calendar = CalendarQuota::new(store, "cal", CalendarConfig::default())
        .with_clock(Arc::new(clock.clone()))
        .with_jitter(Jitter::None);
    let rules = [SlidingRule::new(1, MINUTE)];

    fixed.allow("d", "t", 1, MINUTE, 1).await.unwrap();
    sliding.allow("d", "t", &rules, 1).await.unwrap();
    calendar.allow("d", "t", Period::Month, 1, 1).await.unwrap();

    assert_eq!(fixed.decr("d", "t", MINUTE).await.unwrap(), 0);
    sliding.decr("d", "t", &rules).await.unwrap();
    assert_eq!(calendar.decr("d", "t", Period::Month).await.unwrap(), 0);

    assert!(fixed.allow("d", "t", 1, MINUTE, 1).await.unwrap().allowed);
    assert!(sliding.allow("d", "t", &rules, 1).await.unwrap().is_allowed());
    assert!(calendar.allow("d", "t", Period::Month, 1, 1).await.unwrap().allowed);
}
