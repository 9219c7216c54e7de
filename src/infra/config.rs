//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Individual values can then be overridden from the environment
//! (RADAR_SERIAL_PORT, INACTIVITY_TIMEOUT_S, ...).

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub device: String,
    pub baud: u32,
    /// Transport-level timeout for a single line read
    pub read_timeout_ms: u64,
    /// Upper bound on how long the poll loop waits for one read
    pub read_deadline_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyS0".to_string(),
            baud: 115_200,
            read_timeout_ms: 1000,
            read_deadline_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub inactivity_timeout_s: f64,
    pub hysteresis_m: f64,
    /// Free-text annotation attached to every event
    pub note: Option<String>,
    /// Record an absence event when the service shuts down
    pub reset_on_shutdown: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { inactivity_timeout_s: 30.0, hysteresis_m: 0.05, note: None, reset_on_shutdown: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub connect_backoff_ms: u64,
    pub error_backoff_ms: u64,
    /// Minimum time between poll cycles (0 = yield only)
    pub min_poll_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { connect_backoff_ms: 5000, error_backoff_ms: 1000, min_poll_interval_ms: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSONL event log path
    pub path: String,
    /// Extra attempts after a failed append before the event is dropped
    pub append_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path(), append_retries: 2 }
    }
}

fn default_store_path() -> String {
    "presence_events.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    /// HTTP port (0 to disable)
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    sensor_device: String,
    sensor_baud: u32,
    read_timeout_ms: u64,
    read_deadline_ms: u64,
    inactivity_timeout_s: f64,
    hysteresis_m: f64,
    event_note: Option<String>,
    reset_on_shutdown: bool,
    connect_backoff_ms: u64,
    error_backoff_ms: u64,
    min_poll_interval_ms: u64,
    store_path: String,
    store_append_retries: u32,
    api_host: String,
    api_port: u16,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            sensor_device: toml_config.sensor.device,
            sensor_baud: toml_config.sensor.baud,
            read_timeout_ms: toml_config.sensor.read_timeout_ms,
            read_deadline_ms: toml_config.sensor.read_deadline_ms,
            inactivity_timeout_s: toml_config.presence.inactivity_timeout_s,
            hysteresis_m: toml_config.presence.hysteresis_m,
            event_note: toml_config.presence.note,
            reset_on_shutdown: toml_config.presence.reset_on_shutdown,
            connect_backoff_ms: toml_config.polling.connect_backoff_ms,
            error_backoff_ms: toml_config.polling.error_backoff_ms,
            min_poll_interval_ms: toml_config.polling.min_poll_interval_ms,
            store_path: toml_config.store.path,
            store_append_retries: toml_config.store.append_retries,
            api_host: toml_config.api.host,
            api_port: toml_config.api.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Config path when none is given on the command line:
    /// CONFIG_FILE, else config/dev.toml
    pub fn resolve_config_path() -> String {
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config/dev.toml".to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults.
    /// Environment overrides are applied either way.
    pub fn load_from_path(path: &str) -> Self {
        let mut config = match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_file_unavailable_using_defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        config
    }

    /// Override values from environment-style lookups.
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key = %key, value = %raw, "config_env_override_invalid");
                    None
                }
            }
        }

        if let Some(device) = lookup("RADAR_SERIAL_PORT") {
            self.sensor_device = device;
        }
        if let Some(baud) = parsed("RADAR_BAUD_RATE", lookup("RADAR_BAUD_RATE")) {
            self.sensor_baud = baud;
        }
        if let Some(timeout) = parsed("INACTIVITY_TIMEOUT_S", lookup("INACTIVITY_TIMEOUT_S")) {
            self.inactivity_timeout_s = timeout;
        }
        if let Some(h) = parsed("DETECTION_HYSTERESIS_M", lookup("DETECTION_HYSTERESIS_M")) {
            self.hysteresis_m = h;
        }
        if let Some(path) = lookup("EVENT_LOG_PATH").or_else(|| lookup("SQLITE_PATH")) {
            self.store_path = path;
        }
        if let Some(host) = lookup("API_HOST") {
            self.api_host = host;
        }
        if let Some(port) = parsed("API_PORT", lookup("API_PORT")) {
            self.api_port = port;
        }
        if let Some(note) = lookup("EVENT_LOG_NOTES") {
            self.event_note = if note.is_empty() { None } else { Some(note) };
        }
    }

    /// Reject values the presence tracker cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.hysteresis_m.is_finite() || self.hysteresis_m < 0.0 {
            bail!("presence.hysteresis_m must be a finite value >= 0, got {}", self.hysteresis_m);
        }
        if !self.inactivity_timeout_s.is_finite() || self.inactivity_timeout_s <= 0.0 {
            bail!(
                "presence.inactivity_timeout_s must be a finite value > 0, got {}",
                self.inactivity_timeout_s
            );
        }
        if self.sensor_baud == 0 {
            bail!("sensor.baud must be > 0");
        }
        if self.read_timeout_ms == 0 {
            bail!("sensor.read_timeout_ms must be > 0");
        }
        if self.read_deadline_ms < self.read_timeout_ms {
            bail!(
                "sensor.read_deadline_ms ({}) must be >= sensor.read_timeout_ms ({})",
                self.read_deadline_ms,
                self.read_timeout_ms
            );
        }
        if self.store_path.trim().is_empty() {
            bail!("store.path must not be empty");
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn sensor_device(&self) -> &str {
        &self.sensor_device
    }

    pub fn sensor_baud(&self) -> u32 {
        self.sensor_baud
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn inactivity_timeout_s(&self) -> f64 {
        self.inactivity_timeout_s
    }

    /// Inactivity timeout as a duration; callers must have validated first
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.inactivity_timeout_s).unwrap_or(Duration::MAX)
    }

    pub fn hysteresis_m(&self) -> f64 {
        self.hysteresis_m
    }

    pub fn event_note(&self) -> Option<&str> {
        self.event_note.as_deref()
    }

    pub fn reset_on_shutdown(&self) -> bool {
        self.reset_on_shutdown
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn store_path(&self) -> &str {
        &self.store_path
    }

    pub fn store_append_retries(&self) -> u32 {
        self.store_append_retries
    }

    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder methods, mainly for tests and embedding
    pub fn with_inactivity_timeout_s(mut self, secs: f64) -> Self {
        self.inactivity_timeout_s = secs;
        self
    }

    pub fn with_hysteresis_m(mut self, meters: f64) -> Self {
        self.hysteresis_m = meters;
        self
    }

    pub fn with_event_note(mut self, note: Option<&str>) -> Self {
        self.event_note = note.map(str::to_string);
        self
    }

    pub fn with_backoffs_ms(mut self, connect_ms: u64, error_ms: u64) -> Self {
        self.connect_backoff_ms = connect_ms;
        self.error_backoff_ms = error_ms;
        self
    }

    pub fn with_read_timing_ms(mut self, timeout_ms: u64, deadline_ms: u64) -> Self {
        self.read_timeout_ms = timeout_ms;
        self.read_deadline_ms = deadline_ms;
        self
    }

    pub fn with_store_append_retries(mut self, retries: u32) -> Self {
        self.store_append_retries = retries;
        self
    }
}
