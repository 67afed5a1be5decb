//! Configuration module for OCPP CSMS
//!
//! Settings come from an optional TOML file, then environment overrides,
//! then [`validate_config`].

use crate::{CsmsError, CsmsResult};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Main CSMS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ocpp: OcppConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// WebSocket listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Listening port for WebSocket, health and metrics
    pub port: u16,
    /// Maximum concurrent charger connections
    pub max_connections: usize,
    /// Longest accepted charger identity
    pub max_charger_id_length: usize,
    /// WebSocket frame ceiling. Frames between `ocpp.max_message_size` and
    /// this limit are rejected by the codec; larger ones drop the socket.
    pub max_ws_message_size: usize,
    /// Only admit chargers already known to persistence
    pub require_known_station: bool,
    /// Stations registered in the in-memory backend at startup
    pub registered_stations: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9000,
            max_connections: 1000,
            max_charger_id_length: 48,
            max_ws_message_size: 16 * 1024 * 1024,
            require_known_station: false,
            registered_stations: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Protocol engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcppConfig {
    /// WebSocket subprotocols accepted during the upgrade
    pub supported_protocols: Vec<String>,
    /// Heartbeat interval handed out in BootNotification, in seconds
    pub heartbeat_interval: u64,
    /// Default deadline for central system calls, in seconds
    pub call_timeout: u64,
    /// Heartbeat supervisor poll period, in seconds
    pub supervisor_interval: u64,
    /// Largest accepted text frame in bytes
    pub max_message_size: usize,
    /// First transaction id when persistence knows none
    pub first_transaction_id: i32,
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            supported_protocols: vec![ocpp_transport::OCPP16_SUBPROTOCOL.to_string()],
            heartbeat_interval: 300,
            call_timeout: 30,
            supervisor_interval: 30,
            max_message_size: 65536,
            first_transaction_id: 1,
        }
    }
}

impl OcppConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn supervisor_period(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Use PostgreSQL for audit and transactions; in-memory otherwise
    pub enabled: bool,
    /// Database connection URL
    pub url: Option<String>,
    /// Maximum connection pool size
    pub max_connections: u32,
    /// Minimum connection pool size
    pub min_connections: u32,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Create tables on startup
    pub auto_migrate: bool,
    /// Audit records and completed transactions kept by the in-memory backend
    pub memory_retention: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            max_connections: 16,
            min_connections: 1,
            connect_timeout: 30,
            auto_migrate: true,
            memory_retention: crate::persistence::DEFAULT_MEMORY_RETENTION,
        }
    }
}

/// Id tag authorization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept tags not listed anywhere below
    pub accept_unknown: bool,
    pub accepted_id_tags: Vec<String>,
    pub blocked_id_tags: Vec<String>,
    pub expired_id_tags: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            accept_unknown: true,
            accepted_id_tags: Vec::new(),
            blocked_id_tags: Vec::new(),
            expired_id_tags: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Output format: pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    pub enabled: bool,
    /// Metrics namespace
    pub namespace: String,
    /// Histogram buckets for message processing time, in seconds
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "ocpp_csms".to_string(),
            latency_buckets: vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ],
        }
    }
}

impl Config {
    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> CsmsResult<Self> {
        let mut config = match path {
            Some(path) => load_from_file(path)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        validate_config(&config).map_err(|message| CsmsError::Configuration { message })?;
        Ok(config)
    }

    /// Apply `OCPP_*` / `DATABASE_URL` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CsmsResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("OCPP_BIND_ADDRESS") {
            self.server.bind_address = bind;
        }
        if let Some(port) = lookup("OCPP_PORT") {
            self.server.port = parse_env("OCPP_PORT", &port)?;
        }
        if let Some(interval) = lookup("OCPP_HEARTBEAT_INTERVAL") {
            self.ocpp.heartbeat_interval = parse_env("OCPP_HEARTBEAT_INTERVAL", &interval)?;
        }
        if let Some(timeout) = lookup("OCPP_CALL_TIMEOUT") {
            self.ocpp.call_timeout = parse_env("OCPP_CALL_TIMEOUT", &timeout)?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
            self.database.enabled = true;
        }
        if let Some(level) = lookup("OCPP_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> CsmsResult<T> {
    value.trim().parse().map_err(|_| CsmsError::Configuration {
        message: format!("{} has an invalid value: {:?}", key, value),
    })
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path) -> CsmsResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| CsmsError::Configuration {
        message: format!("Failed to read {}: {}", path.display(), e),
    })?;

    toml::from_str(&content).map_err(|e| CsmsError::Configuration {
        message: format!("Failed to parse {}: {}", path.display(), e),
    })
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<(), String> {
    if config.server.max_connections == 0 {
        return Err("max_connections must be greater than 0".to_string());
    }
    if config.server.max_charger_id_length == 0 {
        return Err("max_charger_id_length must be greater than 0".to_string());
    }

    if config.ocpp.supported_protocols.is_empty() {
        return Err("At least one OCPP protocol must be supported".to_string());
    }
    if config.ocpp.heartbeat_interval == 0 || config.ocpp.heartbeat_interval > i32::MAX as u64 {
        return Err("heartbeat_interval must be between 1 and 2^31-1 seconds".to_string());
    }
    if config.ocpp.call_timeout == 0 {
        return Err("call_timeout must be greater than 0".to_string());
    }
    if config.ocpp.supervisor_interval == 0 {
        return Err("supervisor_interval must be greater than 0".to_string());
    }
    if config.ocpp.max_message_size < 64 {
        return Err("max_message_size must be at least 64 bytes".to_string());
    }
    if config.server.max_ws_message_size < config.ocpp.max_message_size {
        return Err("max_ws_message_size must be at least ocpp.max_message_size".to_string());
    }
    if config.ocpp.first_transaction_id < 1 {
        return Err("first_transaction_id must be positive".to_string());
    }

    if !config.database.enabled && config.database.memory_retention == 0 {
        return Err("memory_retention must be greater than 0".to_string());
    }
    if config.database.enabled {
        match config.database.url.as_deref() {
            Some(url) if !url.is_empty() => {
                url::Url::parse(url).map_err(|e| format!("Invalid database URL: {}", e))?;
            }
            _ => return Err("Database URL is required when the database is enabled".to_string()),
        }
        if config.database.max_connections < config.database.min_connections {
            return Err("Database max_connections must be >= min_connections".to_string());
        }
    }

    match config.logging.format.as_str() {
        "pretty" | "compact" | "json" => {}
        other => return Err(format!("Unknown log format: {}", other)),
    }

    if config.metrics.enabled && config.metrics.namespace.is_empty() {
        return Err("Metrics namespace cannot be empty".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.ocpp.heartbeat_interval, 300);
        assert_eq!(config.ocpp.call_timeout, 30);
        assert_eq!(config.ocpp.supported_protocols, vec!["ocpp1.6".to_string()]);
        assert!(!config.database.enabled);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[ocpp]
heartbeat_interval = 60

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.ocpp.heartbeat_interval, 60);
        assert_eq!(config.ocpp.call_timeout, 30);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_unreadable_file_is_configuration_error() {
        let result = load_from_file(Path::new("/nonexistent/ocpp-csms.toml"));
        assert!(matches!(result, Err(CsmsError::Configuration { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OCPP_PORT", "9443"),
            ("OCPP_HEARTBEAT_INTERVAL", "120"),
            ("DATABASE_URL", "postgres://localhost/ocpp"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 9443);
        assert_eq!(config.ocpp.heartbeat_interval, 120);
        assert!(config.database.enabled);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| {
            (key == "OCPP_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(CsmsError::Configuration { .. })));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.ocpp.heartbeat_interval = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.database.enabled = true;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.server.max_ws_message_size = config.ocpp.max_message_size - 1;
        assert!(validate_config(&config).is_err());
    }
}
