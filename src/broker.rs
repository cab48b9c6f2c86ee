//! Resource broker: pick an upstream resource and reserve capacity on it in one step.
//!
//! The fast path is a single [`SharedStore::admit`] call. When that call reports a recovery
//! signal, the broker repairs the cache and tries again:
//!
//! | signal | recovery |
//! |---|---|
//! | pool missing | rebuild the pool from the catalog under the pool lock |
//! | metadata missing | reload that resource from the catalog under its metadata lock |
//! | daily quota exceeded | evict the resource from the pool |
//! | rate limited | sleep for the reported wait, then retry the same resource |
//!
//! The loop is bounded by [`BrokerConfig::max_attempts`] fast-path calls. Catalog reads only
//! happen on the recovery paths.
//!
//! Each broker also keeps a local [`WeightedBalancer`] per pool so selection is spread across
//! members in proportion to their daily limits. The local pick is sent to the store as a hint;
//! the store falls back to the lowest member id when the hint is no longer a member, and the
//! local balancer is resynchronised from the pool when that happens.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::balancer::{Node, WeightedBalancer};
use crate::calendar::{local_time, Period};
use crate::catalog::{ResourceCatalog, ResourceId, ResourceMeta, Tier};
use crate::clock::{Clock, SystemClock};
use crate::config::{BrokerConfig, CalendarConfig, LockConfig, ValidatedSettings};
use crate::dynamic::DynamicConfig;
use crate::error::{Result, StoreError, TollgateError};
use crate::jitter::{as_millis_saturated, Jitter};
use crate::lock::DistributedLock;
use crate::sleeper::{sleep_or_cancel, Sleeper, TokioSleeper};
use crate::store::{member_key, AdmitReply, AdmitRequest, SharedStore};

/// Prefix of the locks guarding pool and metadata refreshes.
pub const LOCK_PREFIX: &str = "tollgate:lock";

/// What the caller wants admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub capability: String,
    pub tier: Tier,
    /// Use exactly this resource instead of selecting from the pool.
    pub resource: Option<ResourceId>,
    pub units: u64,
}

impl AdmissionRequest {
    /// One unit of `capability` from any resource in `tier`.
    pub fn new(capability: impl Into<String>, tier: Tier) -> Self {
        Self { capability: capability.into(), tier, resource: None, units: 1 }
    }

    pub fn resource(mut self, id: ResourceId) -> Self {
        self.resource = Some(id);
        self
    }

    pub fn units(mut self, units: u64) -> Self {
        self.units = units;
        self
    }
}

/// A granted admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// The resource to call the upstream with.
    pub resource: ResourceMeta,
    /// Fast-path calls it took, starting at one.
    pub attempts: usize,
    daily_key: String,
}

impl Admission {
    /// Daily counter the units were reserved against.
    pub fn daily_key(&self) -> &str {
        &self.daily_key
    }
}

/// Local balancer of one pool plus its freshness bookkeeping.
#[derive(Debug, Default)]
struct PoolBalancer {
    balancer: WeightedBalancer,
    synced: AtomicBool,
    synced_at: AtomicU64,
    stale: AtomicBool,
}

impl PoolBalancer {
    fn needs_resync(&self, now: u64, every: Duration) -> bool {
        !self.synced.load(Ordering::Acquire)
            || self.stale.load(Ordering::Acquire)
            || self.balancer.is_empty()
            || now.saturating_sub(self.synced_at.load(Ordering::Acquire))
                >= as_millis_saturated(every)
    }

    fn sync(&self, members: &[(ResourceId, i64)], now: u64) {
        self.balancer.sync(members);
        self.synced_at.store(now, Ordering::Release);
        self.synced.store(true, Ordering::Release);
        self.stale.store(false, Ordering::Release);
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Balancer pick outside `skipped`, falling back to the heaviest node not yet skipped.
    fn next_excluding(&self, skipped: &[ResourceId]) -> Option<ResourceId> {
        let id = self.balancer.next().ok()?;
        if !skipped.contains(&id) {
            return Some(id);
        }
        self.balancer
            .snapshot()
            .into_iter()
            .filter(|node| node.weight > 0 && !skipped.contains(&node.id))
            .max_by_key(|node| node.weight)
            .map(|node| node.id)
    }
}

/// Keys and TTL of the current day, fixed for one fast-path attempt.
struct DailyWindow {
    prefix: String,
    ttl: Duration,
}

/// Selects resources for admission and keeps the shared cache in step with the catalog.
pub struct ResourceBroker<S: SharedStore + ?Sized, C: ResourceCatalog + ?Sized> {
    store: Arc<S>,
    catalog: Arc<C>,
    lock: DistributedLock<S>,
    config: DynamicConfig<BrokerConfig>,
    calendar: CalendarConfig,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    balancers: RwLock<HashMap<String, Arc<PoolBalancer>>>,
}

impl<S: SharedStore + ?Sized, C: ResourceCatalog + ?Sized> fmt::Debug for ResourceBroker<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBroker")
            .field("store", &self.store)
            .field("config", &self.config.get())
            .field("calendar", &self.calendar)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl<S: SharedStore + ?Sized, C: ResourceCatalog + ?Sized> ResourceBroker<S, C> {
    pub fn new(store: Arc<S>, catalog: Arc<C>, config: BrokerConfig) -> Self {
        let lock = DistributedLock::new(Arc::clone(&store), LOCK_PREFIX, LockConfig::default());
        Self {
            store,
            catalog,
            lock,
            config: DynamicConfig::new(config),
            calendar: CalendarConfig::default(),
            clock: Arc::new(SystemClock),
            jitter: Jitter::Full,
            sleeper: Arc::new(TokioSleeper),
            balancers: RwLock::new(HashMap::new()),
        }
    }

    /// Broker tuned from loaded [`ValidatedSettings`].
    pub fn from_settings(store: Arc<S>, catalog: Arc<C>, settings: ValidatedSettings) -> Self {
        Self::new(store, catalog, settings.broker)
            .with_calendar(settings.calendar)
            .with_lock_config(settings.lock)
    }

    /// Sleeper used for rate-limit pauses and lock retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.lock = self.lock.with_sleeper(Arc::clone(&sleeper));
        self.sleeper = sleeper;
        self
    }

    /// Clock used to derive the daily period.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_calendar(mut self, calendar: CalendarConfig) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock = DistributedLock::new(Arc::clone(&self.store), LOCK_PREFIX, config)
            .with_sleeper(Arc::clone(&self.sleeper));
        self
    }

    /// Jitter added to daily counter TTLs.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Handle for retuning the broker while it runs.
    pub fn config_handle(&self) -> DynamicConfig<BrokerConfig> {
        self.config.clone()
    }

    /// Local balancer state for a pool; empty if the pool was never used.
    pub fn balancer_snapshot(&self, capability: &str, tier: Tier) -> Vec<Node> {
        let pool_key = self.config.get().keys().pool_key(capability, tier);
        self.balancers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&pool_key)
            .map(|pool| pool.balancer.snapshot())
            .unwrap_or_default()
    }

    fn pool_balancer(&self, pool_key: &str) -> Arc<PoolBalancer> {
        if let Some(pool) =
            self.balancers.read().unwrap_or_else(|p| p.into_inner()).get(pool_key)
        {
            return Arc::clone(pool);
        }
        let mut balancers = self.balancers.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(balancers.entry(pool_key.to_string()).or_default())
    }

    fn daily_window(&self, config: &BrokerConfig) -> DailyWindow {
        let now = local_time(self.clock.now_millis(), self.calendar.offset());
        let remaining = Period::Day.remaining(now).max(Duration::from_millis(1));
        DailyWindow {
            prefix: config.keys().daily_prefix(&Period::Day.id(now)),
            ttl: self.jitter.extend(remaining, self.calendar.max_jitter()),
        }
    }

    fn no_resource(request: &AdmissionRequest, attempts: usize) -> TollgateError {
        TollgateError::NoResourceAvailable {
            capability: request.capability.clone(),
            tier: request.tier,
            attempts,
        }
    }

    /// Admit `request.units` against one resource.
    ///
    /// Fails with [`TollgateError::NoResourceAvailable`] when the catalog has no eligible
    /// resource, when a caller-specified resource is unusable, or when the attempt budget runs
    /// out. Cancellation is observed between attempts and during every wait.
    pub async fn admit(
        &self,
        request: &AdmissionRequest,
        cancel: &CancellationToken,
    ) -> Result<Admission> {
        if request.units == 0 {
            return Err(TollgateError::InvalidArgument("admission needs at least one unit".into()));
        }
        let config = self.config.get();
        let keys = config.keys();
        let pool_key = keys.pool_key(&request.capability, request.tier);
        let pool = self.pool_balancer(&pool_key);
        let mut retry_with: Option<ResourceId> = None;
        let mut reloaded_requested = false;
        // Members with some daily quota left, but less than this request needs.
        let mut skipped: Vec<ResourceId> = Vec::new();

        for attempt in 1..=config.max_attempts() {
            if cancel.is_cancelled() {
                return Err(TollgateError::Cancelled);
            }

            let hint = match (request.resource, retry_with.take()) {
                (Some(_), _) => None,
                (None, Some(id)) => Some(id),
                (None, None) => match self.pick(&pool, &pool_key, &config, &skipped).await? {
                    None if !skipped.is_empty() => {
                        return Err(Self::no_resource(request, attempt));
                    }
                    picked => picked,
                },
            };
            let daily = self.daily_window(&config);
            let admit = AdmitRequest {
                pool_key: pool_key.clone(),
                meta_prefix: keys.meta_prefix().to_string(),
                daily_prefix: daily.prefix.clone(),
                rate_prefix: keys.rate_prefix().to_string(),
                requested: request.resource,
                preferred: hint,
                units: request.units,
                daily_ttl: daily.ttl,
            };

            match self.store.admit(&admit).await? {
                AdmitReply::Admitted(meta) => {
                    if hint.is_some_and(|h| h != meta.id) {
                        pool.mark_stale();
                    }
                    tracing::debug!(
                        capability = %request.capability,
                        tier = %request.tier,
                        resource = meta.id,
                        attempt,
                        "admitted"
                    );
                    let daily_key = member_key(&daily.prefix, meta.id);
                    return Ok(Admission { resource: meta, attempts: attempt, daily_key });
                }
                AdmitReply::PoolMissing => {
                    tracing::debug!(pool = %pool_key, attempt, "pool missing");
                    let refreshed = self
                        .refresh_pool(request, &pool_key, &pool, &config, attempt, cancel)
                        .await;
                    match refreshed {
                        Err(e) if e.is_lock_contention() => continue,
                        other => other?,
                    }
                }
                AdmitReply::ResourceMissing(id) => {
                    tracing::debug!(resource = id, attempt, "resource metadata missing");
                    if request.resource.is_some() {
                        if reloaded_requested {
                            return Err(Self::no_resource(request, attempt));
                        }
                        reloaded_requested = true;
                    }
                    let reloaded =
                        self.refresh_resource(request, id, &pool_key, &pool, &config, cancel).await;
                    match reloaded {
                        Ok(true) => {}
                        Ok(false) if request.resource.is_some() => {
                            return Err(Self::no_resource(request, attempt));
                        }
                        Ok(false) => {}
                        Err(e) if e.is_lock_contention() => {}
                        Err(e) => return Err(e),
                    }
                }
                AdmitReply::QuotaExceeded(id) => {
                    self.evict(id, &pool_key, &pool, &config).await?;
                    if request.resource.is_some() {
                        return Err(Self::no_resource(request, attempt));
                    }
                }
                AdmitReply::InsufficientQuota { id, remaining } => {
                    tracing::debug!(
                        resource = id,
                        remaining,
                        units = request.units,
                        attempt,
                        "resource lacks daily headroom for request"
                    );
                    if request.resource.is_some() {
                        return Err(Self::no_resource(request, attempt));
                    }
                    if hint != Some(id) {
                        pool.mark_stale();
                    }
                    skipped.push(id);
                }
                AdmitReply::RateLimited { id, wait } => {
                    tracing::debug!(resource = id, wait = ?wait, attempt, "resource rate limited");
                    sleep_or_cancel(self.sleeper.as_ref(), wait, cancel).await?;
                    retry_with = Some(id);
                }
            }
        }

        let attempts = config.max_attempts();
        tracing::warn!(
            capability = %request.capability,
            tier = %request.tier,
            attempts,
            "admission attempts exhausted"
        );
        Err(Self::no_resource(request, attempts))
    }

    /// Give `units` back to the daily quota of an admission whose downstream call failed.
    pub async fn release(&self, admission: &Admission, units: u64) -> Result<u64> {
        let left = self.store.counter_decr(&admission.daily_key, units).await?;
        tracing::debug!(resource = admission.resource.id, units, "daily units released");
        Ok(left)
    }

    async fn pick(
        &self,
        pool: &PoolBalancer,
        pool_key: &str,
        config: &BrokerConfig,
        skipped: &[ResourceId],
    ) -> Result<Option<ResourceId>> {
        let now = self.clock.now_millis();
        if pool.needs_resync(now, config.resync_interval()) {
            let members = self.store.pool_members(pool_key).await?;
            pool.sync(&members, now);
        }
        Ok(pool.next_excluding(skipped))
    }

    async fn refresh_pool(
        &self,
        request: &AdmissionRequest,
        pool_key: &str,
        pool: &PoolBalancer,
        config: &BrokerConfig,
        attempt: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let token = self.lock.acquire(pool_key, cancel).await?;
        let result = self.rebuild_pool(request, pool_key, pool, config, attempt).await;
        if let Err(e) = self.lock.release(pool_key, &token).await {
            tracing::warn!(pool = %pool_key, error = %e, "failed to release pool lock");
        }
        result
    }

    async fn rebuild_pool(
        &self,
        request: &AdmissionRequest,
        pool_key: &str,
        pool: &PoolBalancer,
        config: &BrokerConfig,
        attempt: usize,
    ) -> Result<()> {
        if self.store.exists(pool_key).await? {
            // Another replica rebuilt it while we waited for the lock.
            pool.mark_stale();
            return Ok(());
        }

        let daily = self.daily_window(config);
        let candidates = self.catalog.eligible(&request.capability, request.tier).await?;
        let mut members = Vec::with_capacity(candidates.len());
        for meta in candidates.into_iter().filter(ResourceMeta::is_eligible) {
            if self.is_exhausted(&meta, &daily).await? {
                continue;
            }
            self.cache_meta(&meta, config).await?;
            members.push((meta.id, meta.weight()));
        }

        if members.is_empty() {
            tracing::info!(pool = %pool_key, "no eligible resources in catalog");
            return Err(Self::no_resource(request, attempt));
        }

        let now = local_time(self.clock.now_millis(), self.calendar.offset());
        let ttl = Period::Day.remaining(now).max(Duration::from_millis(1));
        self.store.pool_replace(pool_key, &members, ttl).await?;
        pool.sync(&members, self.clock.now_millis());
        tracing::info!(pool = %pool_key, members = members.len(), "pool refreshed");
        Ok(())
    }

    /// Reload one resource's metadata. Returns false when it is no longer usable.
    async fn refresh_resource(
        &self,
        request: &AdmissionRequest,
        id: ResourceId,
        pool_key: &str,
        pool: &PoolBalancer,
        config: &BrokerConfig,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let meta_key = member_key(config.keys().meta_prefix(), id);
        let token = self.lock.acquire(&meta_key, cancel).await?;
        let result = self.reload_resource(request, id, &meta_key, pool_key, pool, config).await;
        if let Err(e) = self.lock.release(&meta_key, &token).await {
            tracing::warn!(key = %meta_key, error = %e, "failed to release metadata lock");
        }
        result
    }

    async fn reload_resource(
        &self,
        request: &AdmissionRequest,
        id: ResourceId,
        meta_key: &str,
        pool_key: &str,
        pool: &PoolBalancer,
        config: &BrokerConfig,
    ) -> Result<bool> {
        if self.store.exists(meta_key).await? {
            return Ok(true);
        }

        let usable = match self.catalog.resource(id).await? {
            Some(meta)
                if meta.is_eligible()
                    && meta.tier == request.tier
                    && meta.supports(&request.capability) =>
            {
                let daily = self.daily_window(config);
                if self.is_exhausted(&meta, &daily).await? {
                    None
                } else {
                    Some(meta)
                }
            }
            _ => None,
        };

        match usable {
            Some(meta) => {
                self.cache_meta(&meta, config).await?;
                tracing::info!(resource = id, "resource metadata reloaded");
                Ok(true)
            }
            None => {
                self.store.pool_remove(pool_key, id).await?;
                pool.balancer.remove(id);
                tracing::info!(resource = id, pool = %pool_key, "resource no longer eligible");
                Ok(false)
            }
        }
    }

    async fn evict(
        &self,
        id: ResourceId,
        pool_key: &str,
        pool: &PoolBalancer,
        config: &BrokerConfig,
    ) -> Result<()> {
        self.store.pool_remove(pool_key, id).await?;
        self.store.delete(&member_key(config.keys().meta_prefix(), id)).await?;
        pool.balancer.remove(id);
        tracing::info!(resource = id, pool = %pool_key, "resource evicted, daily quota exhausted");
        Ok(())
    }

    async fn is_exhausted(&self, meta: &ResourceMeta, daily: &DailyWindow) -> Result<bool> {
        let key = member_key(&daily.prefix, meta.id);
        Ok(self
            .store
            .counter_detail(&key)
            .await?
            .is_some_and(|detail| detail.current >= meta.daily_limit))
    }

    async fn cache_meta(&self, meta: &ResourceMeta, config: &BrokerConfig) -> Result<()> {
        let json = serde_json::to_string(meta).map_err(StoreError::from)?;
        let key = member_key(config.keys().meta_prefix(), meta.id);
        self.store.put(&key, &json, config.meta_ttl(meta.tier)).await?;
        Ok(())
    }
}
