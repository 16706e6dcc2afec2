use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::connector::ConnectorKind;
use crate::coordinator::CoordinatorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub expirer: ExpirerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Pool size of the submission API
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Pool size used for claims and recovery
    #[serde(default = "default_dispatcher_connections")]
    pub dispatcher_connections: u32,
    /// Pool size used to record outcomes
    #[serde(default = "default_collector_connections")]
    pub collector_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

fn default_dispatcher_connections() -> u32 {
    1
}

fn default_collector_connections() -> u32 {
    3
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            dispatcher_connections: default_dispatcher_connections(),
            collector_connections: default_collector_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange name as stored in the `exchange` dictionary
    #[serde(default = "default_exchange_name")]
    pub name: String,
    #[serde(default)]
    pub kind: ConnectorKind,
    /// REST base URL override
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Fill price used by the simulated exchange
    #[serde(default = "default_simulated_fill_price")]
    pub simulated_fill_price: Decimal,
    #[serde(default)]
    pub simulated_latency_ms: u64,
}

fn default_exchange_name() -> String {
    "BINANCE".to_string()
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_simulated_fill_price() -> Decimal {
    Decimal::ONE_HUNDRED
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: default_exchange_name(),
            kind: ConnectorKind::default(),
            rest_url: None,
            recv_window_ms: default_recv_window_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            simulated_fill_price: default_simulated_fill_price(),
            simulated_latency_ms: 0,
        }
    }
}

impl ExchangeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Identity written into claimed commands
    #[serde(default = "default_connector_id")]
    pub id: i16,
    /// Concurrent exchange calls
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_connector_id() -> i16 {
    1
}

fn default_pool_size() -> usize {
    10
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            id: default_connector_id(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionConfig {
    /// Listen address of the submission API
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Deadline granted to new commands (s)
    #[serde(default = "default_time_for_execution_secs")]
    pub time_for_execution_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_time_for_execution_secs() -> u64 {
    60
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            time_for_execution_secs: default_time_for_execution_secs(),
        }
    }
}

impl SubmissionConfig {
    pub fn time_for_execution(&self) -> Duration {
        Duration::from_secs(self.time_for_execution_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpirerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_expire_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_expire_batch_limit")]
    pub batch_limit: i64,
}

fn default_true() -> bool {
    true
}

fn default_expire_interval_ms() -> u64 {
    1000
}

fn default_expire_batch_limit() -> i64 {
    100
}

impl Default for ExpirerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_expire_interval_ms(),
            batch_limit: default_expire_batch_limit(),
        }
    }
}

impl ExpirerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("EXECRELAY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (EXECRELAY__DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("EXECRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration. Every problem is reported, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database.url is required".to_string());
        }
        if self.database.dispatcher_connections == 0
            || self.database.collector_connections == 0
            || self.database.max_connections == 0
        {
            errors.push("database connection pools need at least one connection".to_string());
        }

        if self.exchange.name.trim().is_empty() {
            errors.push("exchange.name is required".to_string());
        }
        if self.exchange.simulated_fill_price <= Decimal::ZERO {
            errors.push("exchange.simulated_fill_price must be positive".to_string());
        }

        if self.connector.pool_size == 0 {
            errors.push("connector.pool_size must be > 0".to_string());
        }
        errors.extend(self.coordinator.validate(self.connector.pool_size));

        if self.submission.bind.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "submission.bind '{}' is not a socket address",
                self.submission.bind
            ));
        }
        if self.submission.time_for_execution_secs == 0 {
            errors.push("submission.time_for_execution_secs must be > 0".to_string());
        }

        if self.expirer.enabled && (self.expirer.interval_ms == 0 || self.expirer.batch_limit <= 0)
        {
            errors.push("expirer.interval_ms and expirer.batch_limit must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
