use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when a loaded configuration is unusable
#[derive(Error, Debug)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the ceremony service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// In-memory cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rule evaluation configuration
    #[serde(default)]
    pub rules: RulesConfig,
    /// Response-time monitoring configuration
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
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
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound for the member lookup on the trigger path
    #[serde(default = "default_member_lookup_timeout_ms")]
    pub member_lookup_timeout_ms: u64,
    /// Upper bound for the health check datastore round-trip
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Interval between full rule/video reloads
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Lifetime of a cached member entry
    #[serde(default = "default_member_ttl_secs")]
    pub member_ttl_secs: u64,
}

/// Rule evaluation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    /// Offset of the venue's local time from UTC, in minutes.
    /// Applies to time-window rules and to daily statistics dates.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// Response-time monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    /// Responses slower than this count as SLA violations
    #[serde(default = "default_sla_threshold_ms")]
    pub sla_threshold_ms: u64,
    /// Minimum share of fast responses (percent) for the target to be met
    #[serde(default = "default_target_score")]
    pub target_score: f64,
    /// Trailing window used when a report request names no dates
    #[serde(default = "default_report_days")]
    pub default_report_days: u32,
    /// Number of days of per-day buckets kept in memory
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum number of ids accepted by the preload endpoint
    #[serde(default = "default_max_preload_videos")]
    pub max_preload_videos: usize,
}

// Default value functions
fn default_service_name() -> String {
    "ceremony-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_member_lookup_timeout_ms() -> u64 {
    100
}

fn default_health_check_timeout_ms() -> u64 {
    1000
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_member_ttl_secs() -> u64 {
    300
}

fn default_sla_threshold_ms() -> u64 {
    500
}

fn default_target_score() -> f64 {
    95.0
}

fn default_report_days() -> u32 {
    7
}

fn default_retention_days() -> u32 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_preload_videos() -> usize {
    100
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "ceremony-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/ceremony").required(false))
            .add_source(config::File::with_name("/etc/ceremony/ceremony").required(false))
            // Override with environment variables
            // CEREMONY__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("CEREMONY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(invalid(
                "database.min_connections",
                "must not exceed database.max_connections",
            ));
        }
        if self.database.member_lookup_timeout_ms == 0 {
            return Err(invalid("database.member_lookup_timeout_ms", "must be greater than 0"));
        }
        if self.cache.refresh_interval_secs == 0 {
            return Err(invalid("cache.refresh_interval_secs", "must be greater than 0"));
        }
        if self.cache.member_ttl_secs == 0 {
            return Err(invalid("cache.member_ttl_secs", "must be greater than 0"));
        }
        if self.rules.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(invalid(
                "rules.utc_offset_minutes",
                "must be within one day of UTC",
            ));
        }
        if self.performance.sla_threshold_ms == 0 {
            return Err(invalid("performance.sla_threshold_ms", "must be greater than 0"));
        }
        if !(0.0..=100.0).contains(&self.performance.target_score) {
            return Err(invalid("performance.target_score", "must be between 0 and 100"));
        }
        if self.performance.default_report_days == 0
            || self.performance.default_report_days > MAX_REPORT_DAYS
        {
            return Err(invalid(
                "performance.default_report_days",
                "must be between 1 and 366",
            ));
        }
        Ok(())
    }

    /// Get member lookup timeout as Duration
    pub fn member_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.database.member_lookup_timeout_ms)
    }

    /// Get health check timeout as Duration
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.database.health_check_timeout_ms)
    }

    /// Get cache refresh interval as Duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache.refresh_interval_secs)
    }

    /// Get member cache TTL as Duration
    pub fn member_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.member_ttl_secs)
    }
}

impl DatabaseConfig {
    /// Get pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RulesConfig {
    /// The configured venue zone
    pub fn zone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

/// Longest default reporting window, in days
const MAX_REPORT_DAYS: u32 = 366;

fn invalid(field: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            member_ttl_secs: default_member_ttl_secs(),
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sla_threshold_ms: default_sla_threshold_ms(),
            target_score: default_target_score(),
            default_report_days: default_report_days(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_preload_videos: default_max_preload_videos(),
        }
    }
}
