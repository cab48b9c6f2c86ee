#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Admission primitives for services that share scarce upstream resources (vendor API keys,
//! SMS senders, mailboxes) across many replicas.
//!
//! ## Features
//!
//! - **Distributed lock** with random tokens, TTL and compare-and-delete release
//! - **Quota counters**: fixed window, multi-window conjunction and calendar aligned
//! - **Token bucket** rate limiting with a cancellable wait and a tower layer
//! - **Smooth weighted round-robin** balancer
//! - **Resource broker** that selects a resource and reserves quota and rate in one store call,
//!   repairing its cache from a catalog when the store says it is stale
//!
//! All shared state lives behind the [`SharedStore`] trait. [`InMemoryStore`] ships here for
//! tests and single-process use; the `tollgate-redis` crate provides a Redis backend.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tollgate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> tollgate::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let catalog = Arc::new(InMemoryCatalog::new());
//!     catalog.insert(ResourceMeta {
//!         id: 1,
//!         capabilities: vec!["geocode".into()],
//!         tier: Tier::Shared,
//!         status: ResourceStatus::Active,
//!         daily_limit: 1_000,
//!         per_second_limit: 10,
//!         credential: "vendor-key-1".into(),
//!     });
//!
//!     let broker = ResourceBroker::new(store, catalog, BrokerConfig::default());
//!     let request = AdmissionRequest::new("geocode", Tier::Shared);
//!     let admission = broker.admit(&request, &CancellationToken::new()).await?;
//!     assert_eq!(admission.resource.credential, "vendor-key-1");
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod broker;
pub mod calendar;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod jitter;
pub mod lock;
pub mod prelude;
pub mod quota;
pub mod rate_limit;
pub mod sleeper;
pub mod store;

// Re-exports
pub use balancer::{BalancerError, WeightedBalancer};
pub use broker::{Admission, AdmissionRequest, ResourceBroker};
pub use calendar::Period;
pub use catalog::{InMemoryCatalog, ResourceCatalog, ResourceId, ResourceMeta, ResourceStatus, Tier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BrokerConfig, BrokerConfigBuilder, BrokerKeys, CalendarConfig, ConfigError, LockConfig,
    Settings, ValidatedSettings,
};
pub use dynamic::DynamicConfig;
pub use error::{CatalogError, QuotaExceeded, Result, StoreError, TollgateError};
pub use jitter::Jitter;
pub use lock::{DistributedLock, LockToken, ReleaseOutcome};
pub use quota::{CalendarQuota, FixedWindowQuota, QuotaDecision, SlidingQuota, SlidingRule};
pub use rate_limit::{BucketDecision, BucketShape, RateLimitLayer, TokenBucket};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{InMemoryStore, SharedStore};
