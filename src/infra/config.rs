//! Configuration loading from TOML files
//!
//! The file is selected with `--config <path>` (default: config/dev.toml).
//! Every section is optional; missing keys take the defaults below.

use crate::domain::interval::{IntervalConfig, MAX_INTERVAL_SECS};
use crate::domain::types::Carrier;
use crate::io::carrier_client::CarrierEndpoint;
use crate::io::circuit_breaker::CircuitBreakerConfig;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Which codes a scheduler tick picks up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Active codes whose `next_check_at` has passed, oldest-due first
    #[default]
    Due,
    /// Every active code, least recently checked first
    All,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Due => "due",
            SelectionPolicy::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub batch_size: usize,
    pub selection: SelectionPolicy,
    /// Pause between carrier groups within a tick
    pub carrier_pause_ms: u64,
    /// Pause between sub-batches of one carrier group
    pub sub_batch_pause_ms: u64,
    /// Concurrency for carriers without an explicit `max_concurrency`
    pub default_concurrency: usize,
    /// UTC hour of the daily retention run
    pub maintenance_hour_utc: u32,
    pub retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            batch_size: 10,
            selection: SelectionPolicy::Due,
            carrier_pause_ms: 1000,
            sub_batch_pause_ms: 500,
            default_concurrency: 2,
            maintenance_hour_utc: 2,
            retention_days: 90,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn carrier_pause(&self) -> Duration {
        Duration::from_millis(self.carrier_pause_ms)
    }

    pub fn sub_batch_pause(&self) -> Duration {
        Duration::from_millis(self.sub_batch_pause_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub id: String,
    /// Carrier assumed when a reconciliation request names none
    pub default_carrier: Carrier,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { id: "tracking-reconciler".to_string(), default_carrier: Carrier::Carriers }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Outbound events go to `{topic_prefix}/{event_type}`
    pub topic_prefix: String,
    /// Inbound contract events
    pub contract_topic: String,
    pub queue_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "tracking-reconciler".to_string(),
            topic_prefix: "tracking".to_string(),
            contract_topic: "contract.created".to_string(),
            queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 30, http_port: 9090 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// JSONL snapshot loaded at startup and written on shutdown
    pub snapshot_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub last_check_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { last_check_ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub carriers: Vec<CarrierEndpoint>,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_id: String,
    default_carrier: Carrier,
    scheduler: SchedulerConfig,
    intervals: IntervalConfig,
    circuit_breaker: CircuitBreakerConfig,
    carriers: Vec<CarrierEndpoint>,
    mqtt: MqttConfig,
    metrics_interval_secs: u64,
    metrics_port: u16,
    snapshot_file: Option<String>,
    last_check_ttl_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: "tracking-reconciler".to_string(),
            default_carrier: Carrier::Carriers,
            scheduler: SchedulerConfig::default(),
            intervals: IntervalConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            carriers: vec![CarrierEndpoint::new(Carrier::Carriers, "http://localhost:3002", "")],
            mqtt: MqttConfig::default(),
            metrics_interval_secs: 30,
            metrics_port: 9090,
            snapshot_file: None,
            last_check_ttl_secs: 300,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let carriers = if toml_config.carriers.is_empty() {
            Self::default().carriers
        } else {
            toml_config.carriers
        };

        Self {
            service_id: toml_config.service.id,
            default_carrier: toml_config.service.default_carrier,
            scheduler: toml_config.scheduler,
            intervals: toml_config.intervals,
            circuit_breaker: toml_config.circuit_breaker,
            carriers,
            mqtt: toml_config.mqtt,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            metrics_port: toml_config.metrics.http_port,
            snapshot_file: toml_config.storage.snapshot_file,
            last_check_ttl_secs: toml_config.cache.last_check_ttl_secs,
            config_file,
        }
    }

    /// Load configuration from path, falling back to defaults on error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scheduler;
        if s.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be positive");
        }
        if s.batch_size == 0 {
            bail!("scheduler.batch_size must be positive");
        }
        if s.default_concurrency == 0 {
            bail!("scheduler.default_concurrency must be positive");
        }
        if s.maintenance_hour_utc > 23 {
            bail!("scheduler.maintenance_hour_utc must be 0..=23, got {}", s.maintenance_hour_utc);
        }
        if self.intervals.min_secs == 0 || self.intervals.min_secs > self.intervals.max_secs {
            bail!(
                "intervals: need 0 < min_secs <= max_secs, got {}..{}",
                self.intervals.min_secs,
                self.intervals.max_secs
            );
        }
        if self.intervals.max_secs > MAX_INTERVAL_SECS {
            bail!(
                "intervals.max_secs must be at most {MAX_INTERVAL_SECS}, got {}",
                self.intervals.max_secs
            );
        }
        let ratio = self.circuit_breaker.failure_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            bail!("circuit_breaker.failure_ratio must be in (0, 1], got {ratio}");
        }
        for (i, endpoint) in self.carriers.iter().enumerate() {
            if self.carriers[..i].iter().any(|e| e.name == endpoint.name) {
                bail!("carrier {} configured twice", endpoint.name);
            }
            if !endpoint.tracking_path.contains("{code}") {
                bail!("carrier {}: tracking_path must contain {{code}}", endpoint.name);
            }
            if endpoint.max_concurrency == Some(0) {
                bail!("carrier {}: max_concurrency must be positive", endpoint.name);
            }
        }
        Ok(())
    }

    /// Parallel reconciliations allowed for one carrier
    pub fn concurrency_for(&self, carrier: Carrier) -> usize {
        self.carriers
            .iter()
            .find(|e| e.name == carrier)
            .and_then(|e| e.max_concurrency)
            .unwrap_or(match carrier {
                Carrier::Carriers => 5,
                Carrier::Correios => 3,
                _ => self.scheduler.default_concurrency,
            })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn default_carrier(&self) -> Carrier {
        self.default_carrier
    }

    pub fn scheduler(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn intervals(&self) -> &IntervalConfig {
        &self.intervals
    }

    pub fn circuit_breaker(&self) -> &CircuitBreakerConfig {
        &self.circuit_breaker
    }

    pub fn carriers(&self) -> &[CarrierEndpoint] {
        &self.carriers
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt.enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt.client_id
    }

    pub fn mqtt_topic_prefix(&self) -> &str {
        &self.mqtt.topic_prefix
    }

    pub fn mqtt_contract_topic(&self) -> &str {
        &self.mqtt.contract_topic
    }

    pub fn mqtt_queue_size(&self) -> usize {
        self.mqtt.queue_size
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn metrics_port(&self) -> u16 {
        self.metrics_port
    }

    pub fn snapshot_file(&self) -> Option<&str> {
        self.snapshot_file.as_deref()
    }

    pub fn last_check_ttl(&self) -> Duration {
        Duration::from_secs(self.last_check_ttl_secs)
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to override scheduler settings
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Builder method for tests to replace the carrier endpoints
    pub fn with_carriers(mut self, carriers: Vec<CarrierEndpoint>) -> Self {
        self.carriers = carriers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_id(), "tracking-reconciler");
        assert_eq!(config.default_carrier(), Carrier::Carriers);
        assert_eq!(config.scheduler().tick_interval_secs, 60);
        assert_eq!(config.scheduler().batch_size, 10);
        assert_eq!(config.scheduler().selection, SelectionPolicy::Due);
        assert_eq!(config.intervals().max_secs, 86_400);
        assert_eq!(config.carriers().len(), 1);
        assert!(!config.mqtt_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_concurrency_defaults_per_carrier() {
        let config = Config::default().with_carriers(vec![]);
        assert_eq!(config.concurrency_for(Carrier::Carriers), 5);
        assert_eq!(config.concurrency_for(Carrier::Correios), 3);
        assert_eq!(config.concurrency_for(Carrier::Acme), 2);

        let mut acme = CarrierEndpoint::new(Carrier::Acme, "http://acme", "t");
        acme.max_concurrency = Some(7);
        let config = Config::default().with_carriers(vec![acme]);
        assert_eq!(config.concurrency_for(Carrier::Acme), 7);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config::default()
            .with_scheduler(SchedulerConfig { batch_size: 0, ..SchedulerConfig::default() });
        assert!(config.validate().is_err());

        let config = Config::default()
            .with_scheduler(SchedulerConfig { maintenance_hour_utc: 24, ..SchedulerConfig::default() });
        assert!(config.validate().is_err());

        let dup = CarrierEndpoint::new(Carrier::Acme, "http://acme", "t");
        let config = Config::default().with_carriers(vec![dup.clone(), dup]);
        assert!(config.validate().is_err());

        let mut bad_path = CarrierEndpoint::new(Carrier::Acme, "http://acme", "t");
        bad_path.tracking_path = "/tracking".to_string();
        assert!(Config::default().with_carriers(vec![bad_path]).validate().is_err());
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let toml_config: TomlConfig = toml::from_str("").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.scheduler(), &SchedulerConfig::default());
        assert_eq!(config.carriers().len(), 1);
        assert_eq!(config.last_check_ttl(), Duration::from_secs(300));
        assert_eq!(config.metrics_port(), 9090);
    }
}
