//! Convenient re-exports for common tollgate types.
pub use crate::{
    balancer::{BalancerError, WeightedBalancer},
    broker::{Admission, AdmissionRequest, ResourceBroker},
    calendar::Period,
    catalog::{InMemoryCatalog, ResourceCatalog, ResourceId, ResourceMeta, ResourceStatus, Tier},
    config::{BrokerConfig, CalendarConfig, LockConfig, Settings},
    error::{QuotaExceeded, StoreError, TollgateError},
    lock::{DistributedLock, ReleaseOutcome},
    quota::{
        CalendarQuota, FixedWindowQuota, QuotaDecision, SlidingDecision, SlidingQuota, SlidingRule,
    },
    rate_limit::{BucketShape, GuardError, RateLimitLayer, TokenBucket},
    store::{InMemoryStore, SharedStore},
};
