//! Resource model and the backing catalog the broker refills its cache from.
//!
//! The catalog is the relational store of upstream accounts (vendor API keys, SMS senders, ...)
//! and their limits. It is only consulted on cache refresh, never on the fast path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Identifier of an upstream resource. `0` is reserved as "none" on store wire formats.
pub type ResourceId = u64;

/// Ownership classification of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Owned by a single tenant; metadata is cached for a long time.
    Exclusive,
    /// Pooled across tenants; metadata is cached briefly.
    Shared,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Exclusive => "exclusive",
            Tier::Shared => "shared",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account status as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Active,
    Disabled,
}

/// Limits and credential of one resource, as cached by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub id: ResourceId,
    pub capabilities: Vec<String>,
    pub tier: Tier,
    pub status: ResourceStatus,
    pub daily_limit: u64,
    pub per_second_limit: u64,
    /// Opaque reference to the credential (key name, vault path, ...).
    pub credential: String,
}

impl ResourceMeta {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Active with positive limits.
    pub fn is_eligible(&self) -> bool {
        self.status == ResourceStatus::Active && self.daily_limit > 0 && self.per_second_limit > 0
    }

    /// Balancer weight: proportional to daily capacity.
    pub fn weight(&self) -> i64 {
        i64::try_from(self.daily_limit).unwrap_or(i64::MAX)
    }
}

/// Read side of the relational store holding resource accounts and their limits.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    /// Resources supporting `capability` in `tier` that are active with positive limits.
    async fn eligible(&self, capability: &str, tier: Tier)
        -> Result<Vec<ResourceMeta>, CatalogError>;

    /// One resource by id, regardless of status.
    async fn resource(&self, id: ResourceId) -> Result<Option<ResourceMeta>, CatalogError>;
}

/// Catalog held in memory. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    rows: Arc<RwLock<BTreeMap<ResourceId, ResourceMeta>>>,
    queries: Arc<AtomicUsize>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: ResourceMeta) {
        if let Ok(mut rows) = self.rows.write() {
            rows.insert(meta.id, meta);
        }
    }

    pub fn remove(&self, id: ResourceId) -> Option<ResourceMeta> {
        self.rows.write().ok().and_then(|mut rows| rows.remove(&id))
    }

    pub fn set_status(&self, id: ResourceId, status: ResourceStatus) {
        if let Ok(mut rows) = self.rows.write() {
            if let Some(meta) = rows.get_mut(&id) {
                meta.status = status;
            }
        }
    }

    /// Number of queries answered so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<ResourceId, ResourceMeta>>, CatalogError>
    {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.rows.read().map_err(|_| CatalogError::Unavailable("catalog table poisoned".into()))
    }
}

#[async_trait]
impl ResourceCatalog for InMemoryCatalog {
    async fn eligible(
        &self,
        capability: &str,
        tier: Tier,
    ) -> Result<Vec<ResourceMeta>, CatalogError> {
        let rows = self.read()?;
        Ok(rows
            .values()
            .filter(|m| m.tier == tier && m.supports(capability) && m.is_eligible())
            .cloned()
            .collect())
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<ResourceMeta>, CatalogError> {
        Ok(self.read()?.get(&id).cloned())
    }
}
