// =============================================================================
// Matrixon Telemetry - Configuration
// =============================================================================
//
// Project: Matrixon - Telemetry Ingestion & Analytics
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-19
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Layered service configuration: built-in defaults, then an optional TOML
//   file, then `MATRIXON_*` environment variables (`__` separates sections,
//   e.g. `MATRIXON_SOCKET__PORT=9000`).
//
// =============================================================================

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use matrixon_analytics::anomaly::{MAX_SENSITIVITY, MIN_SENSITIVITY};
use matrixon_analytics::AnalyticsConfig;
use matrixon_iot::config::DeviceProvision;
use matrixon_iot::{BrokerConfig, GatewayConfig, SinkConfig, SocketConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "MATRIXON_TELEMETRY_CONFIG";
/// Prefix of configuration overrides in the environment
pub const ENV_PREFIX: &str = "MATRIXON_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<matrixon_iot::IoTError> for ConfigError {
    fn from(err: matrixon_iot::IoTError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily-rotated log files; console only when unset
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "matrixon-telemetry.log".to_string(),
            json: false,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `EnvFilter` directive, e.g. `info,matrixon_iot=debug`
    pub log: String,
    pub logging: LoggingConfig,
    /// Prometheus exporter port; no exporter when unset
    pub metrics_port: Option<u16>,
    pub gateway: GatewayConfig,
    pub socket: SocketConfig,
    pub broker: BrokerConfig,
    pub sink: SinkConfig,
    pub analytics: AnalyticsConfig,
    /// Statically provisioned devices for the in-memory resolver
    pub devices: Vec<DeviceProvision>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: "info".to_string(),
            logging: LoggingConfig::default(),
            metrics_port: None,
            gateway: GatewayConfig::default(),
            socket: SocketConfig::default(),
            broker: BrokerConfig::default(),
            sink: SinkConfig::default(),
            analytics: AnalyticsConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Provider stack: defaults, optional TOML file, environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate; the explicit path wins over `MATRIXON_TELEMETRY_CONFIG`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(from_env);

        let config: Config = Self::figment(path.as_deref()).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.validate()?;
        self.socket.validate()?;
        self.broker.validate()?;
        self.sink.validate()?;

        let analytics = &self.analytics;
        if analytics.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "analytics.history_capacity must be greater than 0".to_string(),
            ));
        }
        if analytics.anomaly_log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "analytics.anomaly_log_capacity must be greater than 0".to_string(),
            ));
        }
        if !(MIN_SENSITIVITY..=MAX_SENSITIVITY).contains(&analytics.sensitivity) {
            return Err(ConfigError::Invalid(format!(
                "analytics.sensitivity must be within [{MIN_SENSITIVITY}, {MAX_SENSITIVITY}], got {}",
                analytics.sensitivity
            )));
        }

        let mut credentials: Vec<&str> = self.devices.iter().map(|d| d.credential.as_str()).collect();
        credentials.sort_unstable();
        if let Some(pair) = credentials.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(format!("duplicate device credential '{}'", pair[0])));
        }
        Ok(())
    }

    /// Effective configuration rendered as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}
