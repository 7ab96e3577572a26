//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Subscription filter for device pings
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Enable publishing of event updates and alerts
    #[serde(default = "default_mqtt_egress_enabled")]
    pub enabled: bool,
    /// Prefix for `<prefix>/events/<device topic>` and `<prefix>/notifications/<device topic>`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self { enabled: default_mqtt_egress_enabled(), topic_prefix: default_topic_prefix() }
    }
}

fn default_mqtt_egress_enabled() -> bool {
    true
}

fn default_topic_prefix() -> String {
    "garage".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// File path for the door event history (JSONL format), empty to disable
    #[serde(default = "default_history_file")]
    pub file: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { file: default_history_file() }
    }
}

fn default_history_file() -> String {
    "door_events.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// How often every device is checked for doors left open
    #[serde(default = "default_alert_check_interval")]
    pub check_interval_secs: u64,
    /// How often doors are re-evaluated from their last sensor reading, so a
    /// door that stops pinging mid-travel still escalates
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,
    #[serde(default)]
    pub snooze_enabled: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_alert_check_interval(),
            recheck_interval_secs: default_recheck_interval(),
            snooze_enabled: false,
        }
    }
}

fn default_alert_check_interval() -> u64 {
    60
}

fn default_recheck_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Count what would be deleted without deleting
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            max_age_days: default_max_age_days(),
            interval_secs: default_retention_interval(),
        }
    }
}

fn default_max_age_days() -> u64 {
    14
}

fn default_retention_interval() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Installation name, used in the MQTT client id
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "garage".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_egress_enabled: bool,
    mqtt_egress_topic_prefix: String,
    history_file: String,
    alert_check_interval_secs: u64,
    recheck_interval_secs: u64,
    snooze_enabled: bool,
    retention_enabled: bool,
    retention_dry_run: bool,
    retention_max_age_days: u64,
    retention_interval_secs: u64,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: "garage/ping".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_egress_enabled: default_mqtt_egress_enabled(),
            mqtt_egress_topic_prefix: default_topic_prefix(),
            history_file: default_history_file(),
            alert_check_interval_secs: default_alert_check_interval(),
            recheck_interval_secs: default_recheck_interval(),
            snooze_enabled: false,
            retention_enabled: false,
            retention_dry_run: false,
            retention_max_age_days: default_max_age_days(),
            retention_interval_secs: default_retention_interval(),
            metrics_interval_secs: default_metrics_interval(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;

        Ok(Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic: toml_config.mqtt.topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_topic_prefix: toml_config.mqtt_egress.topic_prefix,
            history_file: toml_config.history.file,
            alert_check_interval_secs: toml_config.alerts.check_interval_secs,
            recheck_interval_secs: toml_config.alerts.recheck_interval_secs,
            snooze_enabled: toml_config.alerts.snooze_enabled,
            retention_enabled: toml_config.retention.enabled,
            retention_dry_run: toml_config.retention.dry_run,
            retention_max_age_days: toml_config.retention.max_age_days,
            retention_interval_secs: toml_config.retention.interval_secs,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: "inline".to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_topic_prefix(&self) -> &str {
        &self.mqtt_egress_topic_prefix
    }

    /// Subscription filter for client snooze requests, `<prefix>/snooze/#`
    pub fn snooze_topic_filter(&self) -> String {
        format!("{}/snooze/#", self.mqtt_egress_topic_prefix)
    }

    /// History log path, `None` when disabled
    pub fn history_file(&self) -> Option<&str> {
        Some(self.history_file.as_str()).filter(|path| !path.is_empty())
    }

    pub fn alert_check_interval_secs(&self) -> u64 {
        self.alert_check_interval_secs
    }

    pub fn recheck_interval_secs(&self) -> u64 {
        self.recheck_interval_secs
    }

    pub fn snooze_enabled(&self) -> bool {
        self.snooze_enabled
    }

    pub fn retention_enabled(&self) -> bool {
        self.retention_enabled
    }

    pub fn retention_dry_run(&self) -> bool {
        self.retention_dry_run
    }

    pub fn retention_max_age_days(&self) -> u64 {
        self.retention_max_age_days
    }

    pub fn retention_interval_secs(&self) -> u64 {
        self.retention_interval_secs
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

}
