//! Pluggable waiting.
//!
//! Every suspension point in this crate (lock retries, bucket waits, broker rate-limit pauses)
//! goes through a [`Sleeper`] raced against a caller-owned [`CancellationToken`], so tests can run
//! without real delays and callers can abandon a wait at any time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TollgateError};

/// Source of delays.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Waits on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Completes immediately whatever the requested duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        future::ready(()).boxed()
    }
}

/// Test sleeper that records every requested duration and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(duration);
        }
        future::ready(()).boxed()
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns [`TollgateError::Cancelled`] without sleeping when the token is already cancelled.
pub async fn sleep_or_cancel(
    sleeper: &dyn Sleeper,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(TollgateError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TollgateError::Cancelled),
        _ = sleeper.sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_ignores_duration() {
        let started = tokio::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(3600)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_and_clears() {
        let sleeper = TrackingSleeper::new();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);

        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn sleep_or_cancel_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let sleeper = TrackingSleeper::new();
        sleep_or_cancel(&sleeper, Duration::from_millis(5), &token).await.expect("not cancelled");
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(5)]);
    }

    #[tokio::test]
    async fn sleep_or_cancel_short_circuits_on_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        let sleeper = TrackingSleeper::new();
        let err = sleep_or_cancel(&sleeper, Duration::from_secs(60), &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(sleeper.calls().is_empty(), "no sleep should be requested");
    }

    #[tokio::test]
    async fn sleep_or_cancel_wakes_on_cancel_during_sleep() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let err =
            sleep_or_cancel(&TokioSleeper, Duration::from_secs(30), &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
