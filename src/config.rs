use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use crate::contact::retry::RetryPolicy;

/// Default id of the by-message dimension (segment).
pub const BY_MESSAGE_DIMENSION_ID: Uuid = Uuid::from_u128(0x7558fc89_c25f_4606_bbc5_43b91a382ac9);

/// Top-level configuration for the dimension pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Which dimension to compute and how.
    #[serde(default)]
    pub dimension: DimensionConfig,

    /// First-occurrence cache configuration.
    #[serde(default)]
    pub unique_events: UniqueEventsConfig,

    /// Contact store connection configuration.
    #[serde(default)]
    pub contacts: ContactsConfig,

    /// Input processing configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Custom key strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    /// Event kind, message language, productive and browsed flags.
    #[default]
    ByMessage,
}

/// Dimension configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionConfig {
    #[serde(default)]
    pub kind: DimensionKind,

    /// Dimension (segment) id stamped on emitted records.
    #[serde(default = "default_dimension_id")]
    pub id: Uuid,

    /// Language used when a message event carries none. Default: "en".
    #[serde(default = "default_language")]
    pub default_language: String,
}

/// First-occurrence cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UniqueEventsConfig {
    /// Age after which a confirmation is re-checked against the contact
    /// store. Unset keeps confirmations for the process lifetime.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

/// Contact store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContactsConfig {
    /// Contact store HTTP endpoint (e.g., "http://localhost:8080").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_contacts_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Facet holding first-occurrence event ids. Default: "key_behavior_cache".
    #[serde(default = "default_facet")]
    pub facet: String,

    /// Retry policy for transient lookup failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Input processing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Interactions aggregated concurrently. Default: 4.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dimension_id() -> Uuid {
    BY_MESSAGE_DIMENSION_ID
}

fn default_language() -> String {
    "en".to_string()
}

fn default_contacts_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_facet() -> String {
    "key_behavior_cache".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dimension: DimensionConfig::default(),
            unique_events: UniqueEventsConfig::default(),
            contacts: ContactsConfig::default(),
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DimensionConfig {
    fn default() -> Self {
        Self {
            kind: DimensionKind::default(),
            id: default_dimension_id(),
            default_language: default_language(),
        }
    }
}

impl Default for ContactsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_contacts_timeout(),
            facet: default_facet(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.dimension.id.is_nil() {
            bail!("dimension.id must not be nil");
        }

        if self.dimension.default_language.trim().is_empty() {
            bail!("dimension.default_language is required");
        }

        if self.unique_events.ttl.is_some_and(|ttl| ttl.is_zero()) {
            bail!("unique_events.ttl must be positive when set");
        }

        if self.contacts.endpoint.is_empty() {
            bail!("contacts.endpoint is required");
        }

        if self.contacts.timeout.is_zero() {
            bail!("contacts.timeout must be positive");
        }

        if self.contacts.facet.is_empty() {
            bail!("contacts.facet is required");
        }

        let retry = &self.contacts.retry;
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            bail!(
                "contacts.retry.multiplier must be at least 1.0, got {}",
                retry.multiplier
            );
        }

        if retry.max_backoff < retry.initial_backoff {
            bail!(
                "contacts.retry.max_backoff {:?} must not be less than initial_backoff {:?}",
                retry.max_backoff,
                retry.initial_backoff
            );
        }

        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be positive");
        }

        Ok(())
    }
}
