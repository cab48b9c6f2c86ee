//! Live-updatable configuration handle.
//!
//! Reads are lock-free (`ArcSwap`); writers replace the whole value. The broker keeps its
//! [`BrokerConfig`](crate::config::BrokerConfig) here so operators can retune retry ceilings and
//! TTLs without rebuilding it.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Shared handle; clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T>(Arc<ArcSwap<T>>);

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(ArcSwap::new(Arc::new(value))))
    }

    /// The value in force right now. Later writes do not affect the returned snapshot.
    pub fn get(&self) -> Arc<T> {
        self.0.load_full()
    }

    pub fn set(&self, value: T) {
        self.0.store(Arc::new(value));
    }

    /// Derive and store a new value from the current one. `derive` may run more than once when
    /// writers race.
    pub fn update(&self, derive: impl Fn(&T) -> T) {
        self.0.rcu(|current| derive(current));
    }
}
