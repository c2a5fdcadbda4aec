/// Configuration management for centinela

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main centinela configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Session cache policy
    pub cache: CacheConfig,
    /// Sentinel discovery configuration
    pub sentinel: SentinelConfig,
    /// Connection pool sizing per role
    pub pool: PoolConfig,
    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Session cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false every call passes straight through to the session store
    pub enabled: bool,
    /// Fixed TTL of cached session entries, in seconds
    pub session_ttl_sec: u64,
    /// Prefix prepended to every key written by the cache
    pub key_prefix: String,
    /// Capacity of the background write-back queue
    pub writeback_queue_capacity: usize,
    /// Default per-operation timeout in milliseconds
    pub operation_timeout_ms: u64,
    /// Sweep the session namespace after a primary change
    pub flush_on_failover: bool,
}

/// Sentinel discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Seed sentinel addresses (host:port)
    pub seeds: Vec<String>,
    /// Name of the monitored master
    pub master_name: String,
    /// Quorum used when a sentinel does not report one
    pub quorum: usize,
    /// Timeout for a single discovery round trip in milliseconds
    pub discovery_timeout_ms: u64,
    /// Base delay for notification channel reconnects
    pub reconnect_base_ms: u64,
    /// Upper bound for notification channel reconnect delay
    pub reconnect_cap_ms: u64,
    /// Interval between full topology refreshes, in seconds
    pub refresh_interval_sec: u64,
}

/// Pool configuration for both roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub read: PoolSettings,
    pub write: PoolSettings,
}

/// Settings for a single pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout_sec: u64,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

/// Circuit breaker configuration, shared by the read and write circuits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Number of recent calls in the error-rate window
    pub window_size: usize,
    /// Error fraction over the window that trips the circuit (0.0 to 1.0)
    pub error_rate_threshold: f64,
    /// Initial open duration in milliseconds
    pub open_duration_ms: u64,
    /// Cap for the open duration after repeated trips
    pub max_open_duration_ms: u64,
    /// Multiplier applied to the open duration on each consecutive trip
    pub backoff_multiplier: f64,
    /// Successful calls slower than this count as failures in the window
    pub slow_call_threshold_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            sentinel: SentinelConfig {
                seeds: vec!["127.0.0.1:26379".to_string()],
                master_name: "mymaster".to_string(),
                quorum: 2,
                discovery_timeout_ms: 1000,
                reconnect_base_ms: 200,
                reconnect_cap_ms: 5000,
                refresh_interval_sec: 30,
            },
            pool: PoolConfig {
                read: PoolSettings {
                    min_size: 2,
                    max_size: 32,
                    ..PoolSettings::default()
                },
                write: PoolSettings {
                    min_size: 1,
                    max_size: 8,
                    ..PoolSettings::default()
                },
            },
            breaker: BreakerConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_ttl_sec: 300,
            key_prefix: "centinela:".to_string(),
            writeback_queue_capacity: 1024,
            operation_timeout_ms: 50,
            flush_on_failover: true,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 16,
            idle_timeout_sec: 300,
            acquire_timeout_ms: 100,
            connect_timeout_ms: 500,
            health_check_interval_ms: 5000,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_size: 20,
            error_rate_threshold: 0.5,
            open_duration_ms: 5000,
            max_open_duration_ms: 60_000,
            backoff_multiplier: 2.0,
            slow_call_threshold_ms: None,
        }
    }
}

impl CacheConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_sec)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl SentinelConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_sec)
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl BreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    pub fn max_open_duration(&self) -> Duration {
        Duration::from_millis(self.max_open_duration_ms)
    }

    pub fn slow_call_threshold(&self) -> Option<Duration> {
        self.slow_call_threshold_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from TOML file, apply environment overrides and validate
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_env_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Apply `CENTINELA_*` overrides. The lookup is injected so tests do not
    /// have to touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CENTINELA_ENABLED") {
            self.cache.enabled = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "CENTINELA_ENABLED must be a boolean, got {}",
                        other
                    )))
                }
            };
        }

        if let Some(value) = lookup("CENTINELA_SENTINELS") {
            self.sentinel.seeds = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = lookup("CENTINELA_MASTER_NAME") {
            self.sentinel.master_name = value;
        }

        if let Some(value) = lookup("CENTINELA_SESSION_TTL_SEC") {
            self.cache.session_ttl_sec = value.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "CENTINELA_SESSION_TTL_SEC must be an integer, got {}",
                    value
                ))
            })?;
        }

        if let Some(value) = lookup("CENTINELA_LOG_LEVEL") {
            self.logging.level = value;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.session_ttl_sec == 0 {
            return Err(ConfigError::ValidationError(
                "session_ttl_sec must be greater than 0".to_string(),
            ));
        }

        if self.cache.writeback_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "writeback_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.cache.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // A disabled cache never talks to sentinels, so the rest is irrelevant
        if !self.cache.enabled {
            return self.validate_logging();
        }

        if self.sentinel.seeds.is_empty() {
            return Err(ConfigError::ValidationError(
                "sentinel seeds cannot be empty".to_string(),
            ));
        }

        for seed in &self.sentinel.seeds {
            crate::core::NodeAddr::parse(seed).map_err(|_| {
                ConfigError::ValidationError(format!("Invalid sentinel seed: {}", seed))
            })?;
        }

        if self.sentinel.master_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "master_name cannot be empty".to_string(),
            ));
        }

        if self.sentinel.quorum == 0 {
            return Err(ConfigError::ValidationError(
                "quorum must be greater than 0".to_string(),
            ));
        }

        if self.sentinel.reconnect_base_ms == 0
            || self.sentinel.reconnect_cap_ms < self.sentinel.reconnect_base_ms
        {
            return Err(ConfigError::ValidationError(
                "reconnect_cap_ms must be >= reconnect_base_ms > 0".to_string(),
            ));
        }

        for (name, pool) in [("read", &self.pool.read), ("write", &self.pool.write)] {
            if pool.max_size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} pool max_size must be greater than 0",
                    name
                )));
            }
            if pool.min_size > pool.max_size {
                return Err(ConfigError::ValidationError(format!(
                    "{} pool min_size must not exceed max_size",
                    name
                )));
            }
            if pool.acquire_timeout_ms == 0 || pool.health_check_interval_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} pool timeouts and intervals must be greater than 0",
                    name
                )));
            }
        }

        if self.pool.read.max_size < self.pool.write.max_size {
            tracing::warn!(
                read_max = self.pool.read.max_size,
                write_max = self.pool.write.max_size,
                "read pool is smaller than write pool; reads usually dominate traffic"
            );
        }

        let breaker = &self.breaker;
        if breaker.failure_threshold == 0 || breaker.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "breaker failure_threshold and window_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&breaker.error_rate_threshold) {
            return Err(ConfigError::ValidationError(
                "breaker error_rate_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if breaker.open_duration_ms == 0 || breaker.max_open_duration_ms < breaker.open_duration_ms
        {
            return Err(ConfigError::ValidationError(
                "breaker max_open_duration_ms must be >= open_duration_ms > 0".to_string(),
            ));
        }

        if breaker.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "breaker backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        self.validate_logging()
    }

    fn validate_logging(&self) -> Result<(), ConfigError> {
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, profile: &str) -> Result<(), ConfigError> {
        let config = match profile {
            "sentinel" => Config {
                sentinel: SentinelConfig {
                    seeds: vec![
                        "10.0.1.20:26379".to_string(),
                        "10.0.1.21:26379".to_string(),
                        "10.0.1.22:26379".to_string(),
                    ],
                    ..Config::default().sentinel
                },
                ..Default::default()
            },
            "passthrough" => Config {
                cache: CacheConfig {
                    enabled: false,
                    ..CacheConfig::default()
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Profile must be 'sentinel' or 'passthrough'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
