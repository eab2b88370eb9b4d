//! Typed engine settings read from the `engine` section of a YAML config.
//!
//! ```yaml
//! engine:
//!   request_workers: 8
//!   workers: 4
//!   max_requests_per_host: 2
//!   max_requests_special_host:
//!     "example\\.com": 1
//!   download_delay: 0.5
//!   backend:
//!     dupefilter: redis
//!     redis_uri: redis://127.0.0.1:6379
//!   persistence:
//!     enabled: true
//!     dir: /var/lib/sluice
//! ```
//!
//! Durations are written as (fractional) seconds.
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::ConfigError;

/// Upper bound for every duration setting.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub dupefilter: BackendKind,
    pub queue: BackendKind,
    pub counter: BackendKind,
    pub redis_uri: String,
    /// Namespace for every key the shared backends create.
    pub key_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dupefilter: BackendKind::Local,
            queue: BackendKind::Local,
            counter: BackendKind::Local,
            redis_uri: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "sluice".to_string(),
        }
    }
}

impl BackendConfig {
    pub fn any_shared(&self) -> bool {
        [self.dupefilter, self.queue, self.counter]
            .iter()
            .any(|kind| *kind == BackendKind::Redis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub name: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("."),
            name: "default".to_string(),
        }
    }
}

impl PersistenceConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(format!("sluice.{}.json", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers bound to the gated (resource limited) scheduler.
    pub request_workers: usize,
    /// Workers bound to the ungated scheduler.
    pub workers: usize,
    pub max_tries: u32,
    /// Concurrency cap applied to every resource key, 0 disables it.
    pub max_requests_per_host: usize,
    pub max_requests_special_host: BTreeMap<String, usize>,
    #[serde(with = "secs")]
    pub download_delay: Duration,
    pub download_delay_special_host: BTreeMap<String, f64>,
    #[serde(with = "secs")]
    pub capacity_retry_delay: Duration,
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    #[serde(with = "secs")]
    pub join_poll_interval: Duration,
    #[serde(with = "opt_secs")]
    pub computation_timeout: Option<Duration>,
    pub lock_always: bool,
    #[serde(with = "secs")]
    pub shutdown_timeout: Duration,
    /// 0 disables the periodic statistics log.
    #[serde(with = "secs")]
    pub stats_interval: Duration,
    pub log_level: String,
    pub backend: BackendConfig,
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_workers: 4,
            workers: 4,
            max_tries: 3,
            max_requests_per_host: 0,
            max_requests_special_host: BTreeMap::new(),
            download_delay: Duration::ZERO,
            download_delay_special_host: BTreeMap::new(),
            capacity_retry_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            join_poll_interval: Duration::from_millis(500),
            computation_timeout: None,
            lock_always: false,
            shutdown_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            log_level: "info".to_string(),
            backend: BackendConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read the `engine` section of a loaded config. A document without one
    /// yields the defaults.
    pub fn from_config(config: &Value) -> Result<Self, ConfigError> {
        let engine_config = match config.get("engine") {
            Some(section) if !section.is_null() => {
                serde_yaml::from_value::<EngineConfig>(section.clone())?
            }
            _ => EngineConfig::default(),
        };
        engine_config.validate()?;
        Ok(engine_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.request_workers == 0 {
            return Err(ConfigError::Invalid(
                "engine.request_workers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "engine.poll_interval must be positive".to_string(),
            ));
        }
        let durations = [
            ("download_delay", Some(self.download_delay)),
            ("capacity_retry_delay", Some(self.capacity_retry_delay)),
            ("poll_interval", Some(self.poll_interval)),
            ("join_poll_interval", Some(self.join_poll_interval)),
            ("computation_timeout", self.computation_timeout),
            ("shutdown_timeout", Some(self.shutdown_timeout)),
            ("stats_interval", Some(self.stats_interval)),
        ];
        for (name, value) in durations {
            check_duration(&format!("engine.{name}"), value)?;
        }
        self.concurrency_patterns()?;
        for pattern in self.delay_patterns()? {
            check_duration(
                &format!("engine.download_delay_special_host.{}", pattern.pattern()),
                Some(pattern.value),
            )?;
        }
        Ok(())
    }

    pub fn concurrency_patterns(
        &self,
    ) -> Result<Vec<ResourcePattern<usize>>, ConfigError> {
        self.max_requests_special_host
            .iter()
            .map(|(pattern, cap)| ResourcePattern::new(pattern, *cap))
            .collect()
    }

    pub fn delay_patterns(
        &self,
    ) -> Result<Vec<ResourcePattern<Duration>>, ConfigError> {
        self.download_delay_special_host
            .iter()
            .map(|(pattern, delay)| {
                let delay = Duration::try_from_secs_f64(*delay).map_err(|e| {
                    ConfigError::Invalid(format!("delay for '{pattern}': {e}"))
                })?;
                ResourcePattern::new(pattern, delay)
            })
            .collect()
    }
}

fn check_duration(name: &str, value: Option<Duration>) -> Result<(), ConfigError> {
    match value {
        Some(value) if value > MAX_DURATION => Err(ConfigError::Invalid(format!(
            "{name} must not exceed {}s",
            MAX_DURATION.as_secs()
        ))),
        _ => Ok(()),
    }
}

/// A regular expression over resource keys paired with the limit it sets.
/// Matching is unanchored, so `example\.com` also covers its subdomains.
#[derive(Debug, Clone)]
pub struct ResourcePattern<T> {
    regex: Regex,
    pub value: T,
}

impl<T> ResourcePattern<T> {
    pub fn new(pattern: &str, value: T) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| {
            ConfigError::Invalid(format!("bad resource pattern '{pattern}': {e}"))
        })?;
        Ok(Self { regex, value })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn matches(&self, resource_key: &str) -> bool {
        self.regex.is_match(resource_key)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|v| Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom))
            .transpose()
    }
}
