//! Distributed mutual-exclusion lock over a [`SharedStore`].
//!
//! Acquisition is `set_if_absent` with a random token and a TTL; release is a compare-and-delete
//! so only the holder can free the key. A crashed holder blocks others for at most the TTL.
//!
//! ```rust
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tollgate::{DistributedLock, InMemoryStore, LockConfig, ReleaseOutcome};
//!
//! # #[tokio::main]
//! # async fn main() -> tollgate::Result<()> {
//! let lock = DistributedLock::new(Arc::new(InMemoryStore::new()), "locks", LockConfig::default());
//! let cancel = CancellationToken::new();
//! let token = lock.acquire("refresh:geocode", &cancel).await?;
//! // ... critical section ...
//! assert_eq!(lock.release("refresh:geocode", &token).await?, ReleaseOutcome::Released);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{Result, TollgateError};
use crate::sleeper::{sleep_or_cancel, Sleeper, TokioSleeper};
use crate::store::SharedStore;

/// Proof of ownership handed out by [`DistributedLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What [`DistributedLock::release`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The key held our token and was deleted.
    Released,
    /// The key was gone or held by someone else; nothing changed.
    Noop,
}

/// Named locks stored under a common prefix.
#[derive(Debug)]
pub struct DistributedLock<S: SharedStore + ?Sized> {
    store: Arc<S>,
    prefix: String,
    config: LockConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: SharedStore + ?Sized> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            config: self.config.clone(),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<S: SharedStore + ?Sized> DistributedLock<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>, config: LockConfig) -> Self {
        Self { store, prefix: prefix.into(), config, sleeper: Arc::new(TokioSleeper) }
    }

    /// Replace the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Store key guarding `target`.
    pub fn key(&self, target: &str) -> String {
        format!("{}:{}", self.prefix, target)
    }

    /// Take the lock on `target`, retrying up to the configured number of tries.
    pub async fn acquire(&self, target: &str, cancel: &CancellationToken) -> Result<LockToken> {
        let key = self.key(target);
        let token = LockToken(Uuid::new_v4().to_string());
        let tries = self.config.tries();

        for attempt in 1..=tries {
            if cancel.is_cancelled() {
                return Err(TollgateError::Cancelled);
            }
            if self.store.set_if_absent(&key, token.as_str(), self.config.ttl()).await? {
                tracing::debug!(lock = %target, key = %key, attempt, "lock acquired");
                return Ok(token);
            }
            if attempt < tries {
                sleep_or_cancel(self.sleeper.as_ref(), self.config.wait(), cancel).await?;
            }
        }

        tracing::warn!(lock = %target, key = %key, attempts = tries, "lock acquisition exhausted");
        Err(TollgateError::LockAcquisitionFailed { target: target.to_string(), attempts: tries })
    }

    /// Release `target` if `token` still owns it.
    pub async fn release(&self, target: &str, token: &LockToken) -> Result<ReleaseOutcome> {
        let key = self.key(target);
        if self.store.delete_if_equals(&key, token.as_str()).await? {
            tracing::debug!(lock = %target, key = %key, "lock released");
            Ok(ReleaseOutcome::Released)
        } else {
            tracing::debug!(lock = %target, key = %key, "lock release was a no-op");
            Ok(ReleaseOutcome::Noop)
        }
    }
}
