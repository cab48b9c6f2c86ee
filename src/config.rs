//! Validated configuration for locks, calendar counters and the broker.
//!
//! Each config type validates on construction. [`Settings`] is the serde-facing form with
//! millisecond fields; services load it with whatever format they already use and convert it
//! with `TryFrom`.

use std::fmt;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;

use crate::catalog::Tier;

/// Errors produced while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A count that must be at least one was zero.
    ZeroCount(&'static str),
    /// A duration that must be positive was zero.
    ZeroDuration(&'static str),
    /// UTC offset outside ±24h.
    InvalidUtcOffset(i32),
    /// A key prefix was empty or contained whitespace.
    InvalidPrefix(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroCount(field) => write!(f, "{field} must be > 0"),
            ConfigError::ZeroDuration(field) => write!(f, "{field} must be a positive duration"),
            ConfigError::InvalidUtcOffset(secs) => {
                write!(f, "utc offset must be within ±24h (got {secs}s)")
            }
            ConfigError::InvalidPrefix(field) => {
                write!(f, "{field} must be non-empty and contain no whitespace")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn check_prefix(field: &'static str, prefix: &str) -> Result<(), ConfigError> {
    if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidPrefix(field));
    }
    Ok(())
}

/// Distributed lock tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    ttl: Duration,
    tries: usize,
    wait: Duration,
}

impl LockConfig {
    /// `ttl` bounds how long a crashed holder blocks others; `tries` counts total attempts.
    pub fn new(ttl: Duration, tries: usize, wait: Duration) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("lock ttl"));
        }
        if tries == 0 {
            return Err(ConfigError::ZeroCount("lock tries"));
        }
        Ok(Self { ttl, tries, wait })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn tries(&self) -> usize {
        self.tries
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(10), tries: 50, wait: Duration::from_millis(100) }
    }
}

/// Calendar alignment for period counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarConfig {
    offset: FixedOffset,
    max_jitter: Duration,
}

impl CalendarConfig {
    pub fn new(utc_offset_secs: i32, max_jitter: Duration) -> Result<Self, ConfigError> {
        let offset = FixedOffset::east_opt(utc_offset_secs)
            .ok_or(ConfigError::InvalidUtcOffset(utc_offset_secs))?;
        Ok(Self { offset, max_jitter })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Upper bound of the random TTL extension.
    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self { offset: Utc.fix(), max_jitter: Duration::from_secs(60) }
    }
}

/// Key namespaces used by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerKeys {
    pool: String,
    meta: String,
    daily: String,
    rate: String,
}

impl BrokerKeys {
    pub fn new(
        pool: impl Into<String>,
        meta: impl Into<String>,
        daily: impl Into<String>,
        rate: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let keys =
            Self { pool: pool.into(), meta: meta.into(), daily: daily.into(), rate: rate.into() };
        check_prefix("pool prefix", &keys.pool)?;
        check_prefix("meta prefix", &keys.meta)?;
        check_prefix("daily prefix", &keys.daily)?;
        check_prefix("rate prefix", &keys.rate)?;
        Ok(keys)
    }

    /// `{pool}:{capability}:{tier}`
    pub fn pool_key(&self, capability: &str, tier: Tier) -> String {
        format!("{}:{}:{}", self.pool, capability, tier)
    }

    pub fn meta_prefix(&self) -> &str {
        &self.meta
    }

    /// Daily counters are namespaced by period so each day starts fresh.
    pub fn daily_prefix(&self, period_id: &str) -> String {
        format!("{}:{}", self.daily, period_id)
    }

    pub fn rate_prefix(&self) -> &str {
        &self.rate
    }
}

impl Default for BrokerKeys {
    fn default() -> Self {
        Self {
            pool: "tollgate:pool".into(),
            meta: "tollgate:meta".into(),
            daily: "tollgate:daily".into(),
            rate: "tollgate:rate".into(),
        }
    }
}

/// Broker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    max_attempts: usize,
    resync_interval: Duration,
    exclusive_meta_ttl: Duration,
    shared_meta_ttl: Duration,
    keys: BrokerKeys,
}

impl BrokerConfig {
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }

    /// Ceiling on fast-path round trips per admission.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// How often a broker re-reads pool membership into its local balancer.
    pub fn resync_interval(&self) -> Duration {
        self.resync_interval
    }

    /// Cache lifetime of resource metadata for the given tier.
    pub fn meta_ttl(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Exclusive => self.exclusive_meta_ttl,
            Tier::Shared => self.shared_meta_ttl,
        }
    }

    pub fn keys(&self) -> &BrokerKeys {
        &self.keys
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfigBuilder::new().defaults()
    }
}

/// Builder for [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct BrokerConfigBuilder {
    max_attempts: usize,
    resync_interval: Duration,
    exclusive_meta_ttl: Duration,
    shared_meta_ttl: Duration,
    keys: BrokerKeys,
}

impl BrokerConfigBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 8,
            resync_interval: Duration::from_secs(30),
            exclusive_meta_ttl: Duration::from_secs(24 * 60 * 60),
            shared_meta_ttl: Duration::from_secs(5 * 60),
            keys: BrokerKeys::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn exclusive_meta_ttl(mut self, ttl: Duration) -> Self {
        self.exclusive_meta_ttl = ttl;
        self
    }

    pub fn shared_meta_ttl(mut self, ttl: Duration) -> Self {
        self.shared_meta_ttl = ttl;
        self
    }

    pub fn keys(mut self, keys: BrokerKeys) -> Self {
        self.keys = keys;
        self
    }

    fn defaults(self) -> BrokerConfig {
        BrokerConfig {
            max_attempts: self.max_attempts,
            resync_interval: self.resync_interval,
            exclusive_meta_ttl: self.exclusive_meta_ttl,
            shared_meta_ttl: self.shared_meta_ttl,
            keys: self.keys,
        }
    }

    /// Build the config, validating inputs.
    pub fn build(self) -> Result<BrokerConfig, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroCount("max_attempts"));
        }
        if self.exclusive_meta_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("exclusive_meta_ttl"));
        }
        if self.shared_meta_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("shared_meta_ttl"));
        }
        Ok(self.defaults())
    }
}

impl Default for BrokerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde-facing settings. Durations are milliseconds; missing fields take the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lock_ttl_ms: u64,
    pub lock_tries: usize,
    pub lock_wait_ms: u64,
    pub utc_offset_secs: i32,
    pub max_jitter_ms: u64,
    pub max_attempts: usize,
    pub resync_interval_ms: u64,
    pub exclusive_meta_ttl_ms: u64,
    pub shared_meta_ttl_ms: u64,
    pub pool_prefix: String,
    pub meta_prefix: String,
    pub daily_prefix: String,
    pub rate_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 10_000,
            lock_tries: 50,
            lock_wait_ms: 100,
            utc_offset_secs: 0,
            max_jitter_ms: 60_000,
            max_attempts: 8,
            resync_interval_ms: 30_000,
            exclusive_meta_ttl_ms: 24 * 60 * 60 * 1000,
            shared_meta_ttl_ms: 5 * 60 * 1000,
            pool_prefix: "tollgate:pool".into(),
            meta_prefix: "tollgate:meta".into(),
            daily_prefix: "tollgate:daily".into(),
            rate_prefix: "tollgate:rate".into(),
        }
    }
}

/// Validated bundle produced from [`Settings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSettings {
    pub lock: LockConfig,
    pub calendar: CalendarConfig,
    pub broker: BrokerConfig,
}

impl TryFrom<Settings> for ValidatedSettings {
    type Error = ConfigError;

    fn try_from(s: Settings) -> Result<Self, Self::Error> {
        let lock = LockConfig::new(
            Duration::from_millis(s.lock_ttl_ms),
            s.lock_tries,
            Duration::from_millis(s.lock_wait_ms),
        )?;
        let calendar =
            CalendarConfig::new(s.utc_offset_secs, Duration::from_millis(s.max_jitter_ms))?;
        let broker = BrokerConfig::builder()
            .max_attempts(s.max_attempts)
            .resync_interval(Duration::from_millis(s.resync_interval_ms))
            .exclusive_meta_ttl(Duration::from_millis(s.exclusive_meta_ttl_ms))
            .shared_meta_ttl(Duration::from_millis(s.shared_meta_ttl_ms))
            .keys(BrokerKeys::new(s.pool_prefix, s.meta_prefix, s.daily_prefix, s.rate_prefix)?)
            .build()?;
        Ok(Self { lock, calendar, broker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_config_rejects_zero_tries_and_ttl() {
        assert_eq!(
            LockConfig::new(Duration::from_secs(1), 0, Duration::ZERO),
            Err(ConfigError::ZeroCount("lock tries"))
        );
        assert_eq!(
            LockConfig::new(Duration::ZERO, 3, Duration::ZERO),
            Err(ConfigError::ZeroDuration("lock ttl"))
        );
    }

    #[test]
    fn calendar_config_rejects_absurd_offset() {
        let err = CalendarConfig::new(90_000, Duration::ZERO).unwrap_err();
        assert_eq!(err, ConfigError::InvalidUtcOffset(90_000));
        assert!(err.to_string().contains("90000"));
    }

    #[test]
    fn broker_builder_validates_attempts() {
        let err = BrokerConfig::builder().max_attempts(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroCount("max_attempts"));
    }

    #[test]
    fn meta_ttl_follows_tier() {
        let cfg = BrokerConfig::builder()
            .exclusive_meta_ttl(Duration::from_secs(3600))
            .shared_meta_ttl(Duration::from_secs(60))
            .build()
            .expect("valid");
        assert_eq!(cfg.meta_ttl(Tier::Exclusive), Duration::from_secs(3600));
        assert_eq!(cfg.meta_ttl(Tier::Shared), Duration::from_secs(60));
    }

    #[test]
    fn broker_keys_format() {
        let keys = BrokerKeys::default();
        assert_eq!(keys.pool_key("geocode", Tier::Shared), "tollgate:pool:geocode:shared");
        assert_eq!(keys.daily_prefix("20261014"), "tollgate:daily:20261014");
        assert_eq!(
            BrokerKeys::new("", "m", "d", "r").unwrap_err(),
            ConfigError::InvalidPrefix("pool prefix")
        );
    }

    #[test]
    fn settings_parse_with_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "max_attempts": 4, "utc_offset_secs": 28800 }"#).unwrap();
        let validated = ValidatedSettings::try_from(settings).expect("valid settings");
        assert_eq!(validated.broker.max_attempts(), 4);
        assert_eq!(validated.calendar.offset().local_minus_utc(), 28_800);
        assert_eq!(validated.lock, LockConfig::default());
    }

    #[test]
    fn settings_surface_validation_errors() {
        let settings: Settings = serde_json::from_str(r#"{ "lock_tries": 0 }"#).unwrap();
        assert_eq!(
            ValidatedSettings::try_from(settings).unwrap_err(),
            ConfigError::ZeroCount("lock tries")
        );
    }
}
