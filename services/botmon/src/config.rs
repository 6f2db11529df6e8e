//! Configuration for the botmon pipeline.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional `config/botmon` file, then `/etc/botmon/botmon`, then environment
//! variables such as `BOTMON__CLICKHOUSE__URL`.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the botmon service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// ClickHouse connection
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    /// Batching behaviour
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// ClickHouse connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse HTTP URL (e.g., "http://localhost:8123")
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    /// Database name
    #[serde(default = "default_database")]
    pub database: String,
    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,
    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,
}

/// Table names for the two record kinds
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TableNames {
    /// Interaction events table
    #[serde(default = "default_interactions_table")]
    pub interactions: String,
    /// Log entries table
    #[serde(default = "default_logs_table")]
    pub logs: String,
}

/// Batching and flushing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Queue capacity, also the accumulator size that forces a flush
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Periodic flush interval in milliseconds
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,
    /// Mirror every log entry to the tracing output
    #[serde(default)]
    pub echo_logs: bool,
    /// Destination tables
    #[serde(default)]
    pub tables: TableNames,
}

// Default value functions
fn default_service_name() -> String {
    "botmon".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_interactions_table() -> String {
    "updates".to_string()
}

fn default_logs_table() -> String {
    "log".to_string()
}

fn default_buffer_size() -> usize {
    1000
}

fn default_tick_period_ms() -> u64 {
    5000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
            metrics_port: None,
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_database(),
            username: None,
            password: None,
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            interactions: default_interactions_table(),
            logs: default_logs_table(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            tick_period_ms: default_tick_period_ms(),
            echo_logs: false,
            tables: TableNames::default(),
        }
    }
}

impl ClickHouseConfig {
    /// Create a config pointing at the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the database name
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set authentication credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Build the ClickHouse client from this config
    pub fn build_client(&self) -> clickhouse::Client {
        let mut client = clickhouse::Client::default()
            .with_url(&self.url)
            .with_database(&self.database);

        if let Some(ref username) = self.username {
            client = client.with_user(username);
        }
        if let Some(ref password) = self.password {
            client = client.with_password(password);
        }

        client
    }
}

impl MonitorConfig {
    /// Set the buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the flush period
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period_ms = period.as_millis() as u64;
        self
    }

    /// Mirror log entries to tracing
    pub fn with_echo_logs(mut self, enable: bool) -> Self {
        self.echo_logs = enable;
        self
    }

    /// Effective buffer size; zero falls back to the default
    pub fn buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            default_buffer_size()
        } else {
            self.buffer_size
        }
    }

    /// Effective flush period; zero falls back to the default
    pub fn tick_period(&self) -> Duration {
        if self.tick_period_ms == 0 {
            Duration::from_millis(default_tick_period_ms())
        } else {
            Duration::from_millis(self.tick_period_ms)
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("service.name", "botmon")?
            .set_default("service.log_level", "info")?
            .add_source(config::File::with_name("config/botmon").required(false))
            .add_source(config::File::with_name("/etc/botmon/botmon").required(false))
            // BOTMON__CLICKHOUSE__URL -> clickhouse.url
            .add_source(
                config::Environment::with_prefix("BOTMON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clickhouse.url.is_empty() {
            return Err(ConfigError::MissingRequired("clickhouse.url".to_string()));
        }

        if !self.clickhouse.url.starts_with("http://") && !self.clickhouse.url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                key: "clickhouse.url".to_string(),
                message: format!("expected an http(s) URL, got {}", self.clickhouse.url),
            });
        }

        let tables = &self.monitor.tables;
        if tables.interactions.is_empty() {
            return Err(ConfigError::MissingRequired(
                "monitor.tables.interactions".to_string(),
            ));
        }
        if tables.logs.is_empty() {
            return Err(ConfigError::MissingRequired("monitor.tables.logs".to_string()));
        }
        if tables.interactions == tables.logs {
            return Err(ConfigError::InvalidValue {
                key: "monitor.tables".to_string(),
                message: "interactions and logs must use different tables".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.clickhouse.url, "http://localhost:8123");
        assert_eq!(config.monitor.buffer_size(), 1000);
        assert_eq!(config.monitor.tick_period(), Duration::from_secs(5));
        assert_eq!(config.monitor.tables.interactions, "updates");
        assert_eq!(config.monitor.tables.logs, "log");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let monitor = MonitorConfig::default()
            .with_buffer_size(0)
            .with_tick_period(Duration::ZERO);

        assert_eq!(monitor.buffer_size(), 1000);
        assert_eq!(monitor.tick_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.clickhouse.url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        let mut config = Config::default();
        config.clickhouse.url = "localhost:8123".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut config = Config::default();
        config.monitor.tables.logs = "updates".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let config: Config = serde_json::from_str(
            r#"{"clickhouse": {"url": "http://ch:8123"}, "monitor": {"buffer_size": 50}}"#,
        )
        .unwrap();

        assert_eq!(config.clickhouse.url, "http://ch:8123");
        assert_eq!(config.clickhouse.database, "default");
        assert_eq!(config.monitor.buffer_size(), 50);
        assert_eq!(config.monitor.tick_period_ms, 5000);
        assert_eq!(config.service.name, "botmon");
    }
}
