use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    member_key, AdmitReply, AdmitRequest, BucketOutcome, CounterDetail, RuleSetOutcome,
    SharedStore, WindowOutcome, WindowSpec, RATE_WINDOW,
};
use crate::catalog::{ResourceId, ResourceMeta};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::jitter::as_millis_saturated;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Counter(u64),
    Bucket { tokens: f64, last_ms: u64 },
    Pool(BTreeMap<ResourceId, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

impl Entry {
    fn new(value: Value, now: u64, ttl: Duration) -> Self {
        Self { value, expires_at: Some(now.saturating_add(as_millis_saturated(ttl))) }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn ttl(&self, now: u64) -> Option<Duration> {
        self.expires_at.map(|at| Duration::from_millis(at.saturating_sub(now)))
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Codec(format!("key '{key}' holds a value of another kind"))
}

impl State {
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn counter(
        &mut self,
        key: &str,
        now: u64,
    ) -> Result<Option<(u64, Option<Duration>)>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(entry) => match entry.value {
                Value::Counter(c) => Ok(Some((c, entry.ttl(now)))),
                _ => Err(wrong_type(key)),
            },
        }
    }

    /// Add `units`, creating the counter with `ttl` when absent.
    fn bump(&mut self, key: &str, units: u64, ttl: Duration, now: u64) -> Result<u64, StoreError> {
        match self.live(key, now) {
            Some(Entry { value: Value::Counter(c), .. }) => {
                *c = c.saturating_add(units);
                Ok(*c)
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                self.entries.insert(key.to_string(), Entry::new(Value::Counter(units), now, ttl));
                Ok(units)
            }
        }
    }

    fn check_window(
        &mut self,
        key: &str,
        limit: u64,
        units: u64,
        window: Duration,
        now: u64,
    ) -> Result<WindowOutcome, StoreError> {
        let (current, ttl) = self.counter(key, now)?.unwrap_or((0, None));
        if current.saturating_add(units) > limit {
            return Ok(WindowOutcome {
                allowed: false,
                current,
                retry_after: ttl.unwrap_or(window),
            });
        }
        Ok(WindowOutcome { allowed: true, current, retry_after: Duration::ZERO })
    }

    fn text(&mut self, key: &str, now: u64) -> Result<Option<String>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Text(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn pool(
        &mut self,
        key: &str,
        now: u64,
    ) -> Result<Option<&mut BTreeMap<ResourceId, i64>>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Pool(members), .. }) => Ok(Some(members)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

/// Single-process [`SharedStore`].
///
/// Every operation runs under one mutex, which gives the same atomicity the Redis scripts get
/// from the server. Expired entries are purged lazily on access. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Use `clock` for TTLs and bucket refill.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { state: Arc::new(Mutex::new(State::default())), clock: Arc::new(clock) }
    }

    fn lock(&self) -> Result<(MutexGuard<'_, State>, u64), StoreError> {
        let guard = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store poisoned".into()))?;
        Ok((guard, self.clock.now_millis()))
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let (mut state, now) = self.lock()?;
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.entries.insert(key.to_string(), Entry::new(Value::Text(value.to_string()), now, ttl));
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let (mut state, now) = self.lock()?;
        let matches = matches!(
            state.live(key, now),
            Some(Entry { value: Value::Text(current), .. }) if current == expected
        );
        if matches {
            state.entries.remove(key);
        }
        Ok(matches)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (mut state, now) = self.lock()?;
        state.text(key, now)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let (mut state, now) = self.lock()?;
        state.entries.insert(key.to_string(), Entry::new(Value::Text(value.to_string()), now, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let (mut state, _) = self.lock()?;
        state.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let (mut state, now) = self.lock()?;
        Ok(state.live(key, now).is_some())
    }

    async fn window_allow(
        &self,
        key: &str,
        limit: u64,
        units: u64,
        window: Duration,
    ) -> Result<WindowOutcome, StoreError> {
        let (mut state, now) = self.lock()?;
        let outcome = state.check_window(key, limit, units, window, now)?;
        if !outcome.allowed || units == 0 {
            return Ok(outcome);
        }
        let current = state.bump(key, units, window, now)?;
        Ok(WindowOutcome { allowed: true, current, retry_after: Duration::ZERO })
    }

    async fn windows_allow(
        &self,
        rules: &[WindowSpec],
        units: u64,
    ) -> Result<RuleSetOutcome, StoreError> {
        let (mut state, now) = self.lock()?;
        let mut counts = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let outcome = state.check_window(&rule.key, rule.limit, units, rule.window, now)?;
            if !outcome.allowed {
                return Ok(RuleSetOutcome::Rejected {
                    index,
                    current: outcome.current,
                    retry_after: outcome.retry_after,
                });
            }
            counts.push(outcome.current);
        }
        if units > 0 {
            for (count, rule) in counts.iter_mut().zip(rules) {
                *count = state.bump(&rule.key, units, rule.window, now)?;
            }
        }
        Ok(RuleSetOutcome::Allowed { counts })
    }

    async fn counter_decr(&self, key: &str, units: u64) -> Result<u64, StoreError> {
        let (mut state, now) = self.lock()?;
        match state.live(key, now) {
            None => Ok(0),
            Some(Entry { value: Value::Counter(c), .. }) => {
                *c = c.saturating_sub(units);
                Ok(*c)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn counter_detail(&self, key: &str) -> Result<Option<CounterDetail>, StoreError> {
        let (mut state, now) = self.lock()?;
        Ok(state.counter(key, now)?.map(|(current, ttl)| CounterDetail { current, ttl }))
    }

    async fn bucket_take(
        &self,
        key: &str,
        capacity: u64,
        interval: Duration,
        requested: u64,
    ) -> Result<BucketOutcome, StoreError> {
        let (mut state, now) = self.lock()?;
        let capacity_f = capacity as f64;
        let interval_ms = as_millis_saturated(interval).max(1) as f64;

        let (stored, last_ms) = match state.live(key, now) {
            None => (capacity_f, now),
            Some(Entry { value: Value::Bucket { tokens, last_ms }, .. }) => (*tokens, *last_ms),
            Some(_) => return Err(wrong_type(key)),
        };
        let elapsed = now.saturating_sub(last_ms) as f64;
        let mut tokens = (stored + elapsed * capacity_f / interval_ms).min(capacity_f);

        let wanted = requested as f64;
        let (allowed, wait) = if tokens >= wanted {
            tokens -= wanted;
            (true, Duration::ZERO)
        } else {
            let deficit_ms = ((wanted - tokens) * interval_ms / capacity_f.max(1.0)).ceil();
            (false, Duration::from_millis((deficit_ms as u64).max(1)))
        };

        state.entries.insert(
            key.to_string(),
            Entry::new(Value::Bucket { tokens, last_ms: now }, now, interval),
        );
        Ok(BucketOutcome { allowed, remaining: tokens.floor() as u64, wait })
    }

    async fn pool_replace(
        &self,
        key: &str,
        members: &[(ResourceId, i64)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let (mut state, now) = self.lock()?;
        if members.is_empty() {
            state.entries.remove(key);
            return Ok(());
        }
        let pool = members.iter().copied().collect();
        state.entries.insert(key.to_string(), Entry::new(Value::Pool(pool), now, ttl));
        Ok(())
    }

    async fn pool_members(&self, key: &str) -> Result<Vec<(ResourceId, i64)>, StoreError> {
        let (mut state, now) = self.lock()?;
        Ok(state
            .pool(key, now)?
            .map(|members| members.iter().map(|(id, w)| (*id, *w)).collect())
            .unwrap_or_default())
    }

    async fn pool_remove(&self, key: &str, id: ResourceId) -> Result<(), StoreError> {
        let (mut state, now) = self.lock()?;
        let emptied = match state.pool(key, now)? {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            state.entries.remove(key);
        }
        Ok(())
    }

    async fn admit(&self, request: &AdmitRequest) -> Result<AdmitReply, StoreError> {
        let (mut state, now) = self.lock()?;

        let id = match request.requested {
            Some(id) => id,
            None => {
                let Some(members) = state.pool(&request.pool_key, now)? else {
                    return Ok(AdmitReply::PoolMissing);
                };
                match request.preferred.filter(|p| members.contains_key(p)) {
                    Some(preferred) => preferred,
                    None => match members.keys().next() {
                        Some(first) => *first,
                        None => return Ok(AdmitReply::PoolMissing),
                    },
                }
            }
        };

        let Some(raw) = state.text(&member_key(&request.meta_prefix, id), now)? else {
            return Ok(AdmitReply::ResourceMissing(id));
        };
        let meta: ResourceMeta = serde_json::from_str(&raw)?;

        let daily_key = member_key(&request.daily_prefix, id);
        let daily = state.check_window(
            &daily_key,
            meta.daily_limit,
            request.units,
            request.daily_ttl,
            now,
        )?;
        if !daily.allowed {
            let remaining = meta.daily_limit.saturating_sub(daily.current);
            return Ok(if remaining == 0 {
                AdmitReply::QuotaExceeded(id)
            } else {
                AdmitReply::InsufficientQuota { id, remaining }
            });
        }

        let rate_key = member_key(&request.rate_prefix, id);
        let rate =
            state.check_window(&rate_key, meta.per_second_limit, request.units, RATE_WINDOW, now)?;
        if !rate.allowed {
            return Ok(AdmitReply::RateLimited { id, wait: rate.retry_after });
        }

        state.bump(&daily_key, request.units, request.daily_ttl, now)?;
        state.bump(&rate_key, request.units, RATE_WINDOW, now)?;
        Ok(AdmitReply::Admitted(meta))
    }
}
