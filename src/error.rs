//! Error taxonomy for admission primitives.
//!
//! Transient conditions (lock contention, rate-limit waits, stale cache entries) are resolved
//! inside the component that hit them and only surface once that component's own retry budget
//! is spent. Quota rejections are business outcomes and carry enough detail for a caller to
//! render a message. Store faults propagate unchanged.
use std::fmt;
use std::time::Duration;

use crate::catalog::Tier;

/// Convenience alias used throughout the crate.
pub type Result<T, E = TollgateError> = std::result::Result<T, E>;

/// Failure reported by a [`SharedStore`](crate::store::SharedStore) backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored value or reply did not have the expected shape.
    #[error("store codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Failure reported by a [`ResourceCatalog`](crate::catalog::ResourceCatalog).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// The backing database could not answer the query.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Detail attached to a rejected quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded {
    /// Configured limit for the window.
    pub limit: u64,
    /// Units already consumed in the window.
    pub current: u64,
    /// Time until the window resets.
    pub retry_after: Duration,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "quota exceeded ({}/{} used, retry after {:?})",
            self.current, self.limit, self.retry_after
        )
    }
}

/// Unified error type for locks, counters, limiters and the broker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TollgateError {
    /// Every attempt to take the named lock found it held.
    #[error("failed to acquire lock '{target}' after {attempts} attempts")]
    LockAcquisitionFailed { target: String, attempts: usize },
    /// The pool is empty or every member stayed exhausted through recovery.
    #[error("no resource available for {capability}/{tier} after {attempts} attempts")]
    NoResourceAvailable { capability: String, tier: Tier, attempts: usize },
    /// A quota window has no headroom left.
    #[error("{0}")]
    QuotaExceeded(QuotaExceeded),
    /// The caller must wait before the limiter admits the request.
    #[error("rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },
    /// The caller's cancellation token fired during a wait.
    #[error("operation cancelled")]
    Cancelled,
    /// The shared store failed.
    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(#[from] StoreError),
    /// The resource catalog failed during a refresh.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// The request can never succeed as stated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TollgateError {
    /// True for conditions that may clear up on their own if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockAcquisitionFailed { .. }
                | Self::RateLimited { .. }
                | Self::BackingStoreUnavailable(StoreError::Unavailable(_))
        )
    }

    /// Check if this error is lock contention.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockAcquisitionFailed { .. })
    }

    /// Check if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if the broker ran out of candidates.
    pub fn is_no_resource(&self) -> bool {
        matches!(self, Self::NoResourceAvailable { .. })
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            Self::QuotaExceeded(detail) => Some(detail.retry_after),
            _ => None,
        }
    }
}
