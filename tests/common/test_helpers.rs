#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tollgate::{
    BrokerConfig, CatalogError, InMemoryCatalog, InMemoryStore, Jitter, ManualClock,
    ResourceBroker, ResourceCatalog, ResourceId, ResourceMeta, ResourceStatus, Sleeper, Tier,
    TrackingSleeper,
};

/// 2026-10-14T12:00:00Z
pub const NOON_UTC: u64 = 1_791_979_200_000;

pub fn meta(
    id: ResourceId,
    capability: &str,
    tier: Tier,
    daily: u64,
    per_second: u64,
) -> ResourceMeta {
    ResourceMeta {
        id,
        capabilities: vec![capability.to_string()],
        tier,
        status: ResourceStatus::Active,
        daily_limit: daily,
        per_second_limit: per_second,
        credential: format!("credential-{id}"),
    }
}

/// Sleeper that moves a manual clock forward instead of waiting.
#[derive(Debug, Clone)]
pub struct AdvancingSleeper {
    pub clock: ManualClock,
    pub calls: TrackingSleeper,
}

impl AdvancingSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, calls: TrackingSleeper::new() }
    }
}

impl Sleeper for AdvancingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.clock.advance(duration);
        self.calls.sleep(duration)
    }
}

/// Catalog that yields to the scheduler before answering, so concurrent callers interleave.
#[derive(Debug, Clone, Default)]
pub struct YieldingCatalog {
    pub inner: InMemoryCatalog,
}

#[async_trait]
impl ResourceCatalog for YieldingCatalog {
    async fn eligible(
        &self,
        capability: &str,
        tier: Tier,
    ) -> Result<Vec<ResourceMeta>, CatalogError> {
        tokio::task::yield_now().await;
        self.inner.eligible(capability, tier).await
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<ResourceMeta>, CatalogError> {
        tokio::task::yield_now().await;
        self.inner.resource(id).await
    }
}

pub struct Fixture {
    pub clock: ManualClock,
    pub store: Arc<InMemoryStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub sleeper: AdvancingSleeper,
    pub broker: ResourceBroker<InMemoryStore, InMemoryCatalog>,
}

/// Broker over an in-memory store and catalog sharing one manual clock set to noon UTC.
pub fn fixture(config: BrokerConfig) -> Fixture {
    let clock = ManualClock::new(NOON_UTC);
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let catalog = Arc::new(InMemoryCatalog::new());
    let sleeper = AdvancingSleeper::new(clock.clone());
    let broker = ResourceBroker::new(Arc::clone(&store), Arc::clone(&catalog), config)
        .with_clock(Arc::new(clock.clone()))
        .with_sleeper(Arc::new(sleeper.clone()))
        .with_jitter(Jitter::None);
    Fixture { clock, store, catalog, sleeper, broker }
}
