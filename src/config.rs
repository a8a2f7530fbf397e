use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::services::ProfilerSettings;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub mongodb: MongoConfig,
    pub profiler: ProfilerConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    /// Connection string. Empty disables the database: recording still
    /// works, explain and stats report the service as unavailable.
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Operations at or above this duration (ms) are recorded as slow.
    pub slow_threshold_ms: f64,
    /// Ring buffer capacity.
    pub max_records: usize,
    /// Patterns recorded more often than this are flagged as hot.
    pub frequent_pattern_threshold: u64,
    /// Efficiency ratios below this trigger a warning.
    pub low_efficiency_ratio: f64,
    /// Collection for the persistent record store; empty disables
    /// persistence.
    pub persist_collection: String,
    /// Attach a driver command listener that auto-records slow operations.
    pub monitor_commands: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bearer token required on every request; None disables auth.
    pub token: Option<String>,
    /// Client IPs allowed through; empty allows all.
    pub ip_allowlist: Vec<String>,
    pub requests_per_minute: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expose Prometheus metrics and emit profiler telemetry.
    pub enabled: bool,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mongoscope")]
#[command(version, about = "MongoScope - MongoDB slow query profiler")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// MongoDB connection string (overrides config file)
    #[arg(long, value_name = "URI")]
    pub mongodb_uri: Option<String>,

    /// MongoDB database to profile (overrides config file)
    #[arg(long, value_name = "DATABASE")]
    pub mongodb_database: Option<String>,

    /// Slow query threshold in milliseconds (overrides config file)
    #[arg(long, value_name = "MS")]
    pub slow_threshold_ms: Option<f64>,

    /// API bearer token (overrides config file)
    #[arg(long, value_name = "TOKEN")]
    pub api_token: Option<String>,

    /// Logging level (overrides config file, e.g., "info,mongoscope=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Enable/disable metrics exposure (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub metrics_enabled: Option<bool>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with(cli_args)
    }

    fn load_with(cli_args: CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Profiler tunables derived from this configuration.
    pub fn profiler_settings(&self) -> ProfilerSettings {
        ProfilerSettings {
            slow_threshold_ms: self.profiler.slow_threshold_ms,
            max_records: self.profiler.max_records,
            frequent_pattern_threshold: self.profiler.frequent_pattern_threshold,
            low_efficiency_ratio: self.profiler.low_efficiency_ratio,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST: Server host (default: 0.0.0.0)
    /// - APP_SERVER_PORT: Server port (default: 8080)
    /// - APP_MONGODB_URI: MongoDB connection string
    /// - APP_MONGODB_DATABASE: Database to profile
    /// - APP_SLOW_THRESHOLD_MS: Slow query threshold in milliseconds
    /// - APP_MAX_RECORDS: Ring buffer capacity
    /// - APP_PERSIST_COLLECTION: Persistent store collection name
    /// - APP_API_TOKEN: Bearer token required on every API request
    /// - APP_IP_ALLOWLIST: Comma-separated list of allowed client IPs
    /// - APP_REQUESTS_PER_MINUTE: Per-client rate limit
    /// - APP_LOG_LEVEL: Logging level (e.g., "info,mongoscope=debug")
    /// - APP_METRICS_ENABLED: Enable/disable metrics exposure (true/false)
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
                tracing::info!("Override server.port from env: {}", self.server.port);
            }
        }

        if let Ok(uri) = std::env::var("APP_MONGODB_URI") {
            self.mongodb.uri = uri;
            tracing::info!("Override mongodb.uri from env");
        }

        if let Ok(database) = std::env::var("APP_MONGODB_DATABASE") {
            self.mongodb.database = database;
            tracing::info!("Override mongodb.database from env: {}", self.mongodb.database);
        }

        if let Ok(threshold) = std::env::var("APP_SLOW_THRESHOLD_MS") {
            match threshold.parse() {
                Ok(val) => {
                    self.profiler.slow_threshold_ms = val;
                    tracing::info!(
                        "Override profiler.slow_threshold_ms from env: {}",
                        self.profiler.slow_threshold_ms
                    );
                },
                Err(_) => tracing::warn!(
                    "Invalid APP_SLOW_THRESHOLD_MS '{}' (keep {})",
                    threshold,
                    self.profiler.slow_threshold_ms
                ),
            }
        }

        if let Ok(max_records) = std::env::var("APP_MAX_RECORDS") {
            if let Ok(val) = max_records.parse() {
                self.profiler.max_records = val;
                tracing::info!(
                    "Override profiler.max_records from env: {}",
                    self.profiler.max_records
                );
            }
        }

        if let Ok(collection) = std::env::var("APP_PERSIST_COLLECTION") {
            self.profiler.persist_collection = collection;
            tracing::info!(
                "Override profiler.persist_collection from env: {}",
                self.profiler.persist_collection
            );
        }

        if let Ok(token) = std::env::var("APP_API_TOKEN") {
            self.api.token = Some(token);
            tracing::info!("Override api.token from env");
        }

        if let Ok(allowlist) = std::env::var("APP_IP_ALLOWLIST") {
            self.api.ip_allowlist = allowlist
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            tracing::info!(
                "Override api.ip_allowlist from env: {} entries",
                self.api.ip_allowlist.len()
            );
        }

        if let Ok(rpm) = std::env::var("APP_REQUESTS_PER_MINUTE") {
            if let Ok(val) = rpm.parse() {
                self.api.requests_per_minute = val;
                tracing::info!(
                    "Override api.requests_per_minute from env: {}",
                    self.api.requests_per_minute
                );
            }
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(enabled) = std::env::var("APP_METRICS_ENABLED") {
            if let Ok(val) = enabled.parse() {
                self.metrics.enabled = val;
                tracing::info!("Override metrics.enabled from env: {}", self.metrics.enabled);
            }
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(uri) = &args.mongodb_uri {
            self.mongodb.uri = uri.clone();
            tracing::info!("Override mongodb.uri from CLI");
        }

        if let Some(database) = &args.mongodb_database {
            self.mongodb.database = database.clone();
            tracing::info!("Override mongodb.database from CLI: {}", self.mongodb.database);
        }

        if let Some(threshold) = args.slow_threshold_ms {
            self.profiler.slow_threshold_ms = threshold;
            tracing::info!(
                "Override profiler.slow_threshold_ms from CLI: {}",
                self.profiler.slow_threshold_ms
            );
        }

        if let Some(token) = &args.api_token {
            self.api.token = Some(token.clone());
            tracing::info!("Override api.token from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(enabled) = args.metrics_enabled {
            self.metrics.enabled = enabled;
            tracing::info!("Override metrics.enabled from CLI: {}", self.metrics.enabled);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.api.token.is_none() {
            tracing::warn!("No API token configured; the API accepts unauthenticated requests");
        }

        if self.profiler.slow_threshold_ms <= 0.0 {
            anyhow::bail!("profiler.slow_threshold_ms must be > 0");
        }
        if self.profiler.max_records == 0 {
            anyhow::bail!("profiler.max_records must be > 0");
        }
        if self.profiler.low_efficiency_ratio <= 0.0 || self.profiler.low_efficiency_ratio > 1.0 {
            anyhow::bail!("profiler.low_efficiency_ratio must be in (0, 1]");
        }
        if self.api.requests_per_minute == 0 {
            anyhow::bail!("api.requests_per_minute must be > 0");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self { uri: "mongodb://localhost:27017".to_string(), database: "test".to_string() }
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 100.0,
            max_records: 1000,
            frequent_pattern_threshold: 10,
            low_efficiency_ratio: 0.1,
            persist_collection: String::new(),
            monitor_commands: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { token: None, ip_allowlist: Vec::new(), requests_per_minute: 60 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,mongoscope=debug".to_string(),
            file: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.profiler.max_records, 1000);
        assert_eq!(config.api.requests_per_minute, 60);
    }

    #[test]
    fn test_toml_sections_parse() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9090

            [mongodb]
            uri = "mongodb://db:27017"
            database = "app"

            [profiler]
            slow_threshold_ms = 250.0
            max_records = 500
            persist_collection = "slow_queries"

            [api]
            token = "secret"
            ip_allowlist = ["10.0.0.1"]
            requests_per_minute = 30
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.mongodb.database, "app");
        assert_eq!(config.profiler.slow_threshold_ms, 250.0);
        assert_eq!(config.profiler.persist_collection, "slow_queries");
        assert_eq!(config.api.token.as_deref(), Some("secret"));
        assert_eq!(config.api.ip_allowlist, ["10.0.0.1"]);
        // Unspecified sections keep their defaults.
        assert_eq!(config.profiler.frequent_pattern_threshold, 10);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.profiler.low_efficiency_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.profiler.max_records = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.api.requests_per_minute = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = Config::default();
        let args = CommandLineArgs {
            server_port: Some(9999),
            slow_threshold_ms: Some(50.0),
            api_token: Some("cli-token".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.profiler.slow_threshold_ms, 50.0);
        assert_eq!(config.api.token.as_deref(), Some("cli-token"));
    }

    #[test]
    fn test_profiler_settings_mapping() {
        let mut config = Config::default();
        config.profiler.slow_threshold_ms = 200.0;
        config.profiler.frequent_pattern_threshold = 5;
        let settings = config.profiler_settings();
        assert_eq!(settings.slow_threshold_ms, 200.0);
        assert_eq!(settings.frequent_pattern_threshold, 5);
        assert_eq!(settings.low_efficiency_ratio, 0.1);
    }
}
